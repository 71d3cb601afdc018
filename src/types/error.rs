use thiserror::Error;

use super::Uid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors surfaced by the cache, allocator and edge protocols.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    /// An optimistic write lost a race against a concurrent writer.
    #[error("conditional write failed")]
    ConditionFailed,
    /// An overflow batch could not take another item, even after retries.
    #[error("item size exceeded")]
    ItemSizeExceeded,
    /// The gatekeeper already holds a marker for this edge.
    #[error("nodes already attached: {child} -> {parent} via {predicate}")]
    EdgeAlreadyExists {
        /// Child endpoint.
        child: Uid,
        /// Parent endpoint.
        parent: Uid,
        /// Predicate name.
        predicate: String,
    },
    /// The gatekeeper holds no completed marker for this edge.
    #[error("nodes not attached: {child} -> {parent} via {predicate}")]
    EdgeNotAttached {
        /// Child endpoint.
        child: Uid,
        /// Parent endpoint.
        parent: Uid,
        /// Predicate name.
        predicate: String,
    },
    /// The catalog has no such type.
    #[error("type not found: {0}")]
    TypeNotFound(String),
    /// The node carries no type row.
    #[error("no type defined for node {0}")]
    NoTypeDefined(Uid),
    /// The node has no rows under the requested prefix.
    #[error("node not found: {0}")]
    NodeNotFound(Uid),
    /// The type has no attribute of that name.
    #[error("attribute {attr} not defined on type {ty}")]
    AttributeNotFound {
        /// Type name.
        ty: String,
        /// Attribute name.
        attr: String,
    },
    /// A marker pointed at a row that does not hold the edge's slot.
    #[error("no slot for child {child} in row {target}")]
    SlotNotFound {
        /// Row that was scanned.
        target: Uid,
        /// Child that was looked for.
        child: Uid,
    },
    /// A lock could not be acquired within the configured timeout.
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(Uid),
    /// The other side of a rendezvous went away without answering.
    #[error("operation cancelled")]
    Cancelled,
    /// A coordination service has stopped.
    #[error("{0} has shut down")]
    ShutDown(&'static str),
    /// A worker thread could not be started.
    #[error("failed to start worker thread: {0}")]
    Spawn(String),
    /// A caller supplied an argument the operation cannot use.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The storage backend failed in a way the protocols do not model.
    #[error("storage: {0}")]
    Storage(String),
}

impl GraphError {
    /// Whether the error is a transient race absorbed by retry loops.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::ConditionFailed | GraphError::ItemSizeExceeded)
    }

    /// Whether the error is a gatekeeper outcome rather than a system fault.
    pub fn is_gatekeeper_rejection(&self) -> bool {
        matches!(
            self,
            GraphError::EdgeAlreadyExists { .. } | GraphError::EdgeNotAttached { .. }
        )
    }
}
