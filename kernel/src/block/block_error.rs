use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("sector past the end of the device")]
    SectorOutOfBounds,
    #[error("buffer is not exactly one sector")]
    BufferInvalid,
    #[error("refusing to write to a foreign device")]
    Foreign,
}
