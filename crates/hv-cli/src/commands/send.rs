//! `hv send` command.

use anyhow::Result;
use clap::Args;
use hv_node::Transaction;
use serde_json::json;

use crate::opts::{NodeOpts, commit, open_node};
use crate::output::print_success;

use super::{drain_egress, parse_actor, parse_hex_arg};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Target actor ID (hex)
    #[arg(long)]
    pub actor: String,

    /// Function to call
    #[arg(long)]
    pub func: String,

    /// Gas budget
    #[arg(long, default_value_t = 1000)]
    pub gas: u64,

    /// Hex-encoded argument (repeatable)
    #[arg(long = "arg")]
    pub args: Vec<String>,
}

pub async fn cmd_send(opts: &NodeOpts, args: &SendArgs) -> Result<()> {
    let actor = parse_actor(&args.actor)?;
    let call_args = args
        .args
        .iter()
        .map(|a| parse_hex_arg(a))
        .collect::<Result<Vec<_>>>()?;

    let node = open_node(opts).await?;
    let mut egress = node.egress();
    node.submit(Transaction::call(actor, args.func.clone(), call_args, args.gas))?;
    let root = commit(opts, &node).await?;

    print_success(
        opts,
        json!({
            "root": root.to_hex(),
            "egress": drain_egress(&mut egress),
        }),
    )
}
