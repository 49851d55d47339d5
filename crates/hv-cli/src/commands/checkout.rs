//! `hv checkout` command.

use anyhow::{Context, Result};
use clap::Args;
use hv_cbor::Hash;
use serde_json::json;

use crate::opts::{NodeOpts, open_node, write_head};
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct CheckoutArgs {
    /// Previously committed state root
    pub root: String,
}

pub async fn cmd_checkout(opts: &NodeOpts, args: &CheckoutArgs) -> Result<()> {
    let root = Hash::from_hex_str(&args.root).context("parse root")?;
    let node = open_node(opts).await?;
    node.set_state_root(root)
        .with_context(|| format!("checkout {root}"))?;
    write_head(&opts.store_dir, root)?;
    print_success(
        opts,
        json!({ "root": root.to_hex(), "nonce": node.hypervisor().nonce() }),
    )
}
