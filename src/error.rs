/**
 * Error types shared by every stage of an acquisition run.
 */
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::receiver::Endpoint;
use crate::stream_verifier::Protocol;


#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input. Fatal, raised before any network I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Verification failed: unreachable, or a management port instead of data.
    #[error("receiver {serial} at {endpoint} failed verification ({protocol})")]
    Connectivity {
        serial: String,
        endpoint: String,
        protocol: Protocol,
    },

    #[error("acquisition failed for {serial}: {reason}")]
    Acquisition { serial: String, reason: String },

    #[error("engine process failed for {serial}: {reason}")]
    Process { serial: String, reason: String },

    /// A shutdown was requested before the work finished.
    #[error("run cancelled")]
    Cancelled,

    #[error("unable to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to serialize receivers: {0}")]
    Json(#[from] serde_json::Error),
}


impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source: source,
        }
    }

    pub fn connectivity(serial: &str, endpoint: &Endpoint, protocol: Protocol) -> Error {
        Error::Connectivity {
            serial: serial.to_string(),
            endpoint: endpoint.to_string(),
            protocol: protocol,
        }
    }

    pub fn acquisition(serial: &str, reason: impl Into<String>) -> Error {
        Error::Acquisition {
            serial: serial.to_string(),
            reason: reason.into(),
        }
    }

    pub fn process(serial: &str, reason: impl Into<String>) -> Error {
        Error::Process {
            serial: serial.to_string(),
            reason: reason.into(),
        }
    }
}


pub type Result<T> = std::result::Result<T, Error>;
