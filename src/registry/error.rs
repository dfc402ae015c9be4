//! Error types for the node instance registry.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised by a [`super::RegistryStore`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StoreError {
    /// Raised when the state directory or a record file cannot be accessed.
    #[error("failed to access registry state at {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a record cannot be serialized.
    #[error("failed to encode registry record for {instance_id}: {message}")]
    Encode {
        /// Instance whose record failed to encode.
        instance_id: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a persisted record cannot be parsed.
    #[error("failed to decode registry record {path}: {message}")]
    Decode {
        /// Record file that failed to parse.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the store refuses requests entirely.
    #[error("registry store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by [`super::NodeInstanceRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raised when a node is already attributed to a different instance.
    #[error("node {node} already belongs to instance {owner}, not {requested}")]
    DuplicateNode {
        /// Node being registered.
        node: String,
        /// Instance the node is currently attributed to.
        owner: String,
        /// Instance named in the rejected request.
        requested: String,
    },
    /// Raised when removing a node the registry does not know about.
    #[error("node {node} is not registered")]
    UnknownNode {
        /// Node that was requested.
        node: String,
    },
    /// Raised when registering a node against an instance whose last node
    /// has already been removed.
    #[error("instance {instance_id} has been retired and accepts no new nodes")]
    InstanceRetired {
        /// Retired instance.
        instance_id: String,
    },
    /// Raised when retiring an instance that still has nodes.
    #[error("instance {instance_id} still hosts {nodes} node(s)")]
    InstanceInUse {
        /// Instance that was requested.
        instance_id: String,
        /// Number of nodes still attributed to it.
        nodes: usize,
    },
    /// Raised when retiring an instance the registry has never seen.
    #[error("instance {instance_id} is not tracked")]
    UnknownInstance {
        /// Instance that was requested.
        instance_id: String,
    },
    /// Raised when a persisted record holds a node also claimed elsewhere.
    #[error("persisted state attributes node {node} to both {first} and {second}")]
    Conflict {
        /// Node claimed twice.
        node: String,
        /// First instance claiming the node.
        first: String,
        /// Second instance claiming the node.
        second: String,
    },
    /// Raised when the backing store fails; in-memory state is unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}
