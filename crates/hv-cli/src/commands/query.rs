//! Read-only queries: `hv nonce`, `hv storage`, `hv code`.

use anyhow::Result;
use clap::Args;
use hv_kernel::{SCRIPT_TYPE, ScriptModule};
use serde_json::json;

use crate::opts::{NodeOpts, open_node};
use crate::output::print_success;

use super::parse_actor;

#[derive(Args, Debug)]
pub struct ActorArgs {
    /// Actor ID (hex)
    pub actor: String,
}

pub async fn cmd_nonce(opts: &NodeOpts, args: &ActorArgs) -> Result<()> {
    let actor = parse_actor(&args.actor)?;
    let node = open_node(opts).await?;
    print_success(opts, json!(node.nonce(actor)?))
}

pub async fn cmd_storage(opts: &NodeOpts, args: &ActorArgs) -> Result<()> {
    let actor = parse_actor(&args.actor)?;
    let node = open_node(opts).await?;
    let slots: Vec<String> = node.storage(actor)?.iter().map(hex::encode).collect();
    print_success(opts, json!(slots))
}

/// Script modules are shown as JSON, anything else as hex.
pub async fn cmd_code(opts: &NodeOpts, args: &ActorArgs) -> Result<()> {
    let actor = parse_actor(&args.actor)?;
    let node = open_node(opts).await?;
    let record = node.hypervisor().actor_record(actor)?;
    let code = node.code(actor)?;
    if record.type_tag == SCRIPT_TYPE {
        if let Ok(module) = ScriptModule::from_code(&code) {
            return print_success(opts, serde_json::to_value(module)?);
        }
    }
    print_success(opts, json!(hex::encode(code)))
}
