use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Model records that could not be saved or loaded.
    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Recorder(format!("{err:?}"))
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(format!("{err:?}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
