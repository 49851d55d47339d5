//! Wire format of externally submitted transactions.

use hv_kernel::ActorId;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxTarget {
    /// Create a new top-level actor from `code`.
    Create {
        type_tag: u32,
        #[serde(with = "serde_bytes")]
        code: Vec<u8>,
    },
    Actor(ActorId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub target: TxTarget,
    /// Function to call on the target. Optional for `Create`.
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub args: Vec<ByteBuf>,
    /// Gas budget for the call.
    #[serde(default)]
    pub ticks: u64,
}

impl Transaction {
    pub fn call(actor: ActorId, func: impl Into<String>, args: Vec<Vec<u8>>, ticks: u64) -> Self {
        Self {
            target: TxTarget::Actor(actor),
            func: Some(func.into()),
            args: args.into_iter().map(ByteBuf::from).collect(),
            ticks,
        }
    }

    pub fn create(type_tag: u32, code: Vec<u8>) -> Self {
        Self {
            target: TxTarget::Create { type_tag, code },
            func: None,
            args: Vec::new(),
            ticks: 0,
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, NodeError> {
        let tx: Self = serde_cbor::from_slice(raw).map_err(NodeError::Decode)?;
        if matches!(tx.target, TxTarget::Actor(_)) && tx.func.is_none() {
            return Err(NodeError::InvalidTransaction(
                "calls to an existing actor need a function name".into(),
            ));
        }
        Ok(tx)
    }

    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        hv_cbor::to_canonical_cbor(self).map_err(NodeError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_kernel::derive_id;

    #[test]
    fn decode_accepts_encoded_call() {
        let tx = Transaction::call(derive_id(None, 0), "init", vec![b"a".to_vec()], 100);
        assert_eq!(Transaction::decode(&tx.encode().unwrap()).unwrap(), tx);
    }

    #[test]
    fn actor_call_without_function_is_rejected() {
        let mut tx = Transaction::call(derive_id(None, 0), "init", vec![], 1);
        tx.func = None;
        let raw = tx.encode().unwrap();
        assert!(matches!(
            Transaction::decode(&raw),
            Err(NodeError::InvalidTransaction(_))
        ));
        assert!(matches!(Transaction::decode(b"\x01"), Err(NodeError::Decode(_))));
    }
}
