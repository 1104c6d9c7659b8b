//! Domain error types for the recoverable/transient kinds the pipeline can
//! hit. Fatal setup failures stay as `anyhow::Error` in `main`; these are
//! for call sites that need to match on *kind*, not just log and move on.

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("bad container magic: {0:?} (expected DKIF)")]
    BadMagic([u8; 4]),
    #[error("i/o error reading encoder stdout: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended mid-frame (truncated)")]
    Truncated,
}

/// Recoverable failure kinds for a single encoder child lifecycle. The
/// supervisor matches on kind to decide whether to back off and retry
/// (`Spawn`, `MissingStdout`) or just log (`Wait`, since the child is
/// already gone by then).
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder child: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("encoder child produced no stdout handle")]
    MissingStdout,
    #[error("error waiting for encoder child: {0}")]
    Wait(std::io::Error),
}
