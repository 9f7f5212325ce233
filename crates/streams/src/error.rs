//! Error types for the stream system

use thiserror::Error;

/// Errors raised by a single stage, either while it is built or while it
/// processes items.
#[derive(Error, Debug)]
pub enum StageError {
    /// A stage was constructed without a required function or with bad params.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stage type not registered: {0}")]
    NotFound(String),

    /// An iterator or reducer failed (or panicked) on an item.
    #[error("stage '{stage}' failed: {source}")]
    Processing {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("queue closed")]
    QueueClosed,
}

impl StageError {
    pub(crate) fn processing(stage: &str, source: anyhow::Error) -> Self {
        StageError::Processing {
            stage: stage.to_string(),
            source,
        }
    }

    /// Report a processing failure under another stage name.
    pub(crate) fn with_stage(self, name: &str) -> Self {
        match self {
            StageError::Processing { source, .. } => StageError::processing(name, source),
            other => other,
        }
    }

    /// A copy for handing the same failure to more than one consumer.
    ///
    /// The source chain is flattened into its rendered message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            StageError::InvalidArgument(msg) => StageError::InvalidArgument(msg.clone()),
            StageError::NotFound(name) => StageError::NotFound(name.clone()),
            StageError::Processing { stage, source } => {
                StageError::processing(stage, anyhow::anyhow!("{:#}", source))
            }
            StageError::QueueClosed => StageError::QueueClosed,
        }
    }
}

/// Errors surfaced to whoever owns or consumes a chain.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// The chain was cut short by a failure outside this branch's own stages.
    #[error("Pipeline aborted by a failure elsewhere in the chain")]
    Aborted,

    #[error("Invalid pipeline configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
