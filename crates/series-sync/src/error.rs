//! Error types for the series sync service

use std::fmt;

#[derive(Debug)]
pub enum ServiceError {
    Sync(series_cache::SyncError),
    Fetch(series_cache::FetchError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Sync(err) => write!(f, "Sync error: {}", err),
            ServiceError::Fetch(err) => write!(f, "Fetcher error: {}", err),
            ServiceError::Io(err) => write!(f, "IO error: {}", err),
            ServiceError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Sync(err) => Some(err),
            ServiceError::Fetch(err) => Some(err),
            ServiceError::Io(err) => Some(err.as_ref()),
            ServiceError::Config(_) => None,
        }
    }
}

impl From<series_cache::SyncError> for ServiceError {
    fn from(err: series_cache::SyncError) -> Self {
        ServiceError::Sync(err)
    }
}

impl From<series_cache::FetchError> for ServiceError {
    fn from(err: series_cache::FetchError) -> Self {
        ServiceError::Fetch(err)
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServiceError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
