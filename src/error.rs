use thiserror::Error;

use crate::collectors::CollectorError;
use crate::storage::StorageError;

/// Agent-level errors. These are raised while the agent is being assembled
/// and are fatal to the process (or to a single configured input, see
/// [`crate::agent`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("plugin '{name}' is already registered")]
    RegistrationConflict { name: String },

    #[error("plugin name must not be empty")]
    EmptyPluginName,

    #[error("unknown plugin '{name}'")]
    UnknownPlugin { name: String },

    #[error("invalid configuration for plugin '{name}': {source}")]
    PluginConfig {
        name: String,
        #[source]
        source: CollectorError,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;
