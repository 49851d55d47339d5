//! `hv create` command.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use hv_kernel::{SCRIPT_TYPE, ScriptModule};
use hv_node::Transaction;
use serde_json::json;

use crate::opts::{NodeOpts, commit, open_node};
use crate::output::print_success;

use super::{drain_egress, parse_hex_arg};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container type tag
    #[arg(long = "type", default_value_t = SCRIPT_TYPE)]
    pub type_tag: u32,

    /// Code file. JSON script module for the script type, raw bytes otherwise
    #[arg(long)]
    pub code: PathBuf,

    /// Call this function on the new actor right away
    #[arg(long)]
    pub func: Option<String>,

    /// Gas for the initial call
    #[arg(long, default_value_t = 1000)]
    pub gas: u64,

    /// Hex-encoded argument for the initial call (repeatable)
    #[arg(long = "arg")]
    pub args: Vec<String>,
}

pub async fn cmd_create(opts: &NodeOpts, args: &CreateArgs) -> Result<()> {
    let code = load_code(args)?;
    let node = open_node(opts).await?;
    let mut egress = node.egress();

    let mut tx = Transaction::create(args.type_tag, code);
    if let Some(func) = &args.func {
        tx.func = Some(func.clone());
        tx.ticks = args.gas;
        for arg in &args.args {
            tx.args.push(parse_hex_arg(arg)?.into());
        }
    }
    let reply = node.submit(tx)?;
    let root = commit(opts, &node).await?;

    print_success(
        opts,
        json!({
            "actor": reply.actor.to_hex(),
            "exports": reply.module.map(|m| m.exports).unwrap_or_default(),
            "root": root.to_hex(),
            "egress": drain_egress(&mut egress),
        }),
    )
}

fn load_code(args: &CreateArgs) -> Result<Vec<u8>> {
    let bytes = fs::read(&args.code).with_context(|| format!("read {}", args.code.display()))?;
    if args.type_tag != SCRIPT_TYPE {
        return Ok(bytes);
    }
    let module: ScriptModule = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse script module {}", args.code.display()))?;
    Ok(module.to_code()?)
}
