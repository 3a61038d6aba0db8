use std::path::PathBuf;

/// Fatal error kinds of the categorizer.
///
/// Library code never aborts the process; everything that used to be an
/// `exit(1)` surfaces here and the binary decides the exit code.
#[derive(thiserror::Error, Debug)]
pub enum SieveError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "filter {path:?} does not match the size given by its information file: {actual}/{expected} bytes"
    )]
    FilterSizeMismatch {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },

    #[error("filter integrity error: {0}")]
    FilterIntegrity(String),

    #[error("read IDs do not match: {id1:?} vs {id2:?}")]
    PairMismatch { id1: String, id2: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
