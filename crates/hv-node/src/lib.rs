//! Node facade over the hypervisor: transaction ingress, state queries and
//! the egress driver. Transport is left to the embedder.

mod egress;
mod error;
mod node;
mod tx;

pub use egress::{EGRESS_ID, EgressDriver, EgressEvent};
pub use error::NodeError;
pub use node::{IngressReply, Node};
pub use tx::{Transaction, TxTarget};
