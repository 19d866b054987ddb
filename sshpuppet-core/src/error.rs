use thiserror::Error;

/// Failures that abort loading (or reloading) an [`crate::AccessPolicy`].
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("reading access policy document: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing access policy document: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("compiling puppet pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("parsing public key for {owner:?}: {source}")]
    Key {
        owner: String,
        #[source]
        source: russh::keys::ssh_key::Error,
    },

    #[error("access policy defines no admins")]
    NoAdmins,
}
