use thiserror::Error;

/// Application-specific errors for the CLI
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid value for {arg}: {value}")]
    InvalidValue { arg: String, value: String },

    #[error("Run stopped with {count} unfinished batches; continue with `batchmerge resume`")]
    Unfinished { count: usize },

    #[error("Cannot install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Library(#[from] batchmerge::Error),
}
