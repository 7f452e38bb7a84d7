use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`crate::reader::DeviceReader`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReaderError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    /// The stream endpoint will never serve this client, do not reconnect
    #[error("Stream unavailable: {0}")]
    StreamTerminal(String),
}

impl From<reqwest::Error> for ReaderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                ReaderError::Auth(err.to_string())
            }
            _ if err.is_decode() => ReaderError::Decode(err.to_string()),
            _ => ReaderError::Transport(err.to_string()),
        }
    }
}

/// Outcome of a failed poll cycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateError {
    #[error("Authentication failed, re-enter credentials: {0}")]
    AuthFailed(String),

    #[error("Timed out after {0:?} waiting for the device")]
    Timeout(Duration),

    #[error("Error communicating with API: {0}")]
    Unavailable(String),
}

impl UpdateError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, UpdateError::AuthFailed(_))
    }
}

impl From<ReaderError> for UpdateError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::Auth(reason) => UpdateError::AuthFailed(reason),
            other => UpdateError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("Envoy requires re-authentication: {0}")]
    ReauthRequired(UpdateError),
}
