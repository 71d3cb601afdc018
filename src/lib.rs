//! Graph adjacency storage over a partitioned key-value row store.
//!
//! A node is a set of rows sharing its UID as partition key. Each
//! uid-predicate keeps an adjacency row of `(child, state, batch)` slots that
//! spills into overflow rows once it outgrows its embedded capacity, and
//! carries copies of the children's propagated scalars index-aligned with
//! the slots. Attach and detach are guarded by a reverse-edge marker on the
//! child, written with a conditional update, so each edge is applied at
//! most once.
//!
//! The usual entry point is [`Graph`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rowgraph::{Graph, GraphConfig, MemoryStore, ScalarValue, TypeCatalog};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = TypeCatalog::from_toml_str(
//!     r#"
//!     [[types]]
//!     name = "Person"
//!     short = "P"
//!     attrs = [
//!       { name = "Name", kind = "string", short = "N", propagate = true },
//!       { name = "Friends", kind = "uid", short = "F", target = "Person" },
//!     ]
//!     "#,
//! )?;
//! let graph = Graph::new(Arc::new(MemoryStore::new()), catalog, GraphConfig::default());
//! let ann = graph.create_node("Person", &[("Name", ScalarValue::Str("ann".into()))])?;
//! let bob = graph.create_node("Person", &[("Name", ScalarValue::Str("bob".into()))])?;
//! assert!(graph.attach_edge(bob, ann, "Friends").is_empty());
//! assert_eq!(graph.children(ann, "Friends")?.children(), vec![bob]);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod cache;
pub mod catalog;
pub mod config;
pub mod edge;
pub mod metrics;
pub mod overflow;
pub mod primitives;
pub mod storage;
pub mod types;

mod graph;

pub use cache::{CacheHandle, CacheStats, LockMode, NodeCache};
pub use catalog::{AttrDef, DataKind, TypeCatalog, TypeDef};
pub use config::{ConfigError, GraphConfig};
pub use edge::{AdjacencyView, EdgeView};
pub use graph::Graph;
pub use metrics::{CounterMetrics, EdgeMetrics, NoopMetrics};
pub use primitives::scheduler::{AttachTicket, EdgeRequest, EdgeScheduler, SchedulerStats};
pub use primitives::throttle::{Permit, Throttle};
pub use storage::{DataItem, MemoryStore, RowStore, ScalarValue, SlotState};
pub use types::{GraphError, Result, SortKey, Uid};
