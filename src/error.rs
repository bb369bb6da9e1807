use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    Json(serde_json::Error),
    Io(std::io::Error),
    Config(String),
    InvalidZone(u32),
    UpdateFailed(String),
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api { status, body } => write!(f, "API error {status}: {body}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::InvalidZone(id) => write!(f, "invalid zone: {id}"),
            Error::UpdateFailed(msg) => write!(f, "update failed: {msg}"),
            Error::Shutdown => write!(f, "coordinator shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
