use thiserror::Error;

use crate::link::LinkError;

/// Errors surfaced through the CNI invocation contract
#[derive(Debug, Error)]
pub enum Error {
    /// Missing, malformed or contradictory configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Required CNI_* environment variable missing
    #[error("environment error: {0}")]
    Environment(String),

    /// Key material of the wrong length or encoding, or rejected by the device
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Namespace or link lookup failure
    #[error("resource error: {0}")]
    Resource(String),

    /// Address or route mutation failure
    #[error("network error: {0}")]
    Network(String),

    /// Gateway could not identify a single active tunnel
    #[error("discovery error: {0}")]
    Discovery(String),
}

impl Error {
    /// CNI error code for this error
    ///
    /// Codes below 100 are the well-known values from the CNI specification,
    /// the rest are plugin specific.
    pub fn code(&self) -> u32 {
        match self {
            Error::Configuration(_) => 4,
            Error::Environment(_) => 7,
            Error::Crypto(_) => 101,
            Error::Resource(_) => 102,
            Error::Network(_) => 103,
            Error::Discovery(_) => 104,
        }
    }

    pub(crate) fn resource(context: &str, err: LinkError) -> Self {
        Error::Resource(format!("{}: {}", context, err))
    }

    pub(crate) fn network(context: &str, err: LinkError) -> Self {
        Error::Network(format!("{}: {}", context, err))
    }
}
