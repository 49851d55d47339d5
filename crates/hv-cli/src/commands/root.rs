//! `hv root` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::{NodeOpts, commit, open_node};
use crate::output::print_success;

/// Commit whatever is pending and print the root. On a fresh directory this
/// writes the first HEAD.
pub async fn cmd_root(opts: &NodeOpts) -> Result<()> {
    let node = open_node(opts).await?;
    let root = commit(opts, &node).await?;
    print_success(opts, json!(root.to_hex()))
}
