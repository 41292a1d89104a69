use thiserror::Error;

#[derive(Error, Debug)]
pub enum LakeError {
    #[error("Table not found: {0}")]
    NotFound(String),

    #[error("Table already exists: {0}")]
    AlreadyExists(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("Delta table error: {0}")]
    Delta(String),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Pipeline failed during {stage}: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<LakeError>,
    },
}

impl LakeError {
    /// True when the target table has never been written.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LakeError::NotFound(_))
    }
}

impl From<polars::error::PolarsError> for LakeError {
    fn from(err: polars::error::PolarsError) -> Self {
        LakeError::Polars(err.to_string())
    }
}

impl From<deltalake::DeltaTableError> for LakeError {
    fn from(err: deltalake::DeltaTableError) -> Self {
        LakeError::Delta(err.to_string())
    }
}

impl From<deltalake::arrow::error::ArrowError> for LakeError {
    fn from(err: deltalake::arrow::error::ArrowError) -> Self {
        LakeError::Arrow(err.to_string())
    }
}

impl From<deltalake::datafusion::error::DataFusionError> for LakeError {
    fn from(err: deltalake::datafusion::error::DataFusionError) -> Self {
        LakeError::Delta(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LakeError>;
