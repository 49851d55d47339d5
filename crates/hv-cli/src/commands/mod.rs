pub mod checkout;
pub mod create;
pub mod query;
pub mod root;
pub mod send;

use anyhow::{Context, Result};
use hv_kernel::ActorId;
use hv_node::EgressEvent;
use serde_json::Value;
use tokio::sync::broadcast;

pub(crate) fn parse_actor(s: &str) -> Result<ActorId> {
    s.parse().with_context(|| format!("invalid actor id '{s}'"))
}

pub(crate) fn parse_hex_arg(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x")).with_context(|| format!("invalid hex argument '{s}'"))
}

/// Everything published on egress since `rx` subscribed. Call after
/// [`hv_node::Node::state_root`], which flushes pending error events.
pub(crate) fn drain_egress(rx: &mut broadcast::Receiver<EgressEvent>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Ok(value) = serde_json::to_value(&event) {
            events.push(value);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_args_accept_optional_prefix() {
        assert_eq!(parse_hex_arg("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex_arg("ff").unwrap(), vec![255]);
        assert!(parse_hex_arg("zz").is_err());
    }
}
