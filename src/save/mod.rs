pub mod dirty;
pub mod header;
pub mod vault;

pub use dirty::Dirty;
pub use header::Header;
pub use vault::SaveReason;
pub use vault::Vault;

use std::path::PathBuf;

/// everything that can go wrong around a checkpoint. Corrupt and
/// Incompatible are recoverable: quarantine or ignore the file and
/// start the learner fresh.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("checkpoint corrupt, quarantined at {0}")]
    Corrupt(PathBuf),
    #[error("checkpoint schema {found}, expected {expected}")]
    Incompatible { expected: u16, found: u16 },
    #[error("checkpoint tagged for the wrong learner")]
    WrongKind,
    #[error("async save queue full")]
    Backpressure,
    #[error("no checkpoint on disk")]
    Missing,
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}
