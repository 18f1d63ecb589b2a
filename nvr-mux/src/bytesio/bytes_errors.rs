#[derive(Debug, thiserror::Error)]
#[error("byte write failed: {0}")]
pub struct BytesWriteError(#[from] pub std::io::Error);
