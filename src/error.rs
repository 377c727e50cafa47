//! crate error types

use snafu::prelude::*;

use crate::{config::ConfigError, fallback::StatusError, manager::ConnectError};

/// crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// crate error type, every variant converts from its source with `?`
#[derive(Debug, Snafu)]
pub enum Error {
    /// Persistent connection could not be established
    #[snafu(context(false), display("establish streaming connection failed: {source}"))]
    Connect {
        /// source error
        source: ConnectError,
    },

    /// Configuration could not be loaded
    #[snafu(context(false), display("load configuration failed: {source}"))]
    Config {
        /// source error
        source: ConfigError,
    },

    /// Status query of the fallback path failed
    #[snafu(context(false), display("fallback status query failed: {source}"))]
    Status {
        /// source error
        source: StatusError,
    },
}
