use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("kernel error: {0}")]
    Kernel(#[from] hv_kernel::KernelError),
    #[error("failed to decode transaction: {0}")]
    Decode(#[source] serde_cbor::Error),
    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_cbor::Error),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}
