use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{CacheHandle, CacheStats, NodeCache};
use crate::catalog::TypeCatalog;
use crate::config::GraphConfig;
use crate::edge::{self, AdjacencyView, EdgeContext};
use crate::metrics::{default_metrics, EdgeMetrics};
use crate::primitives::scheduler::{EdgeExecutor, EdgeRequest, EdgeScheduler, ATTACH_CLASS};
use crate::primitives::throttle::Throttle;
use crate::storage::{sortkey, DataItem, RowStore, ScalarValue};
use crate::types::{GraphError, Result, Uid};

/// Entry point tying a row store, the node cache and the type catalog
/// together.
///
/// One `Graph` is built at startup and shared by reference (or inside an
/// `Arc` when handed to an [`EdgeScheduler`]). Dropping it drops the cache.
pub struct Graph {
    store: Arc<dyn RowStore>,
    cache: NodeCache,
    catalog: TypeCatalog,
    config: GraphConfig,
    metrics: Arc<dyn EdgeMetrics>,
}

impl Graph {
    /// Builds a graph over `store`. The configuration is normalized first.
    pub fn new(store: Arc<dyn RowStore>, catalog: TypeCatalog, config: GraphConfig) -> Self {
        let config = config.normalize();
        let cache = NodeCache::new(Arc::clone(&store), config.cache_capacity)
            .with_lock_timeout(config.lock_timeout());
        info!(
            types = catalog.len(),
            cache_capacity = config.cache_capacity,
            embedded_threshold = config.embedded_threshold,
            max_overflow = config.max_overflow,
            "graph.open"
        );
        Self {
            store,
            cache,
            catalog,
            config,
            metrics: default_metrics(),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn EdgeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Effective configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Type catalog.
    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Node cache.
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn ctx(&self) -> EdgeContext<'_> {
        EdgeContext {
            store: self.store.as_ref(),
            cache: &self.cache,
            catalog: &self.catalog,
            config: &self.config,
            metrics: self.metrics.as_ref(),
        }
    }

    /// Creates a node of type `ty` with the given scalar attributes.
    ///
    /// Attribute names and value kinds are checked against the catalog, and
    /// every non-nullable scalar must be supplied.
    pub fn create_node(&self, ty: &str, scalars: &[(&str, ScalarValue)]) -> Result<Uid> {
        let def = self.catalog.get(ty)?;
        let mut rows = Vec::with_capacity(scalars.len() + 1);
        rows.push((sortkey::type_row(), DataItem::typed(def.name.clone())));
        for (name, value) in scalars {
            let attr = def.attribute(name)?;
            if !attr.kind.is_scalar() {
                return Err(GraphError::Invalid("uid-predicates are set with attach_edge"));
            }
            if !attr.kind.accepts(value) {
                return Err(GraphError::Invalid("value does not match attribute kind"));
            }
            rows.push((attr.sort_key(), DataItem::scalar(value.clone())));
        }
        let missing = def
            .attrs
            .iter()
            .filter(|attr| attr.kind.is_scalar() && !attr.nullable)
            .any(|attr| !scalars.iter().any(|(name, _)| *name == attr.name));
        if missing {
            return Err(GraphError::Invalid("required attribute missing"));
        }

        let uid = Uid::generate();
        let mut handle = self.cache.lock_for_write(uid, "")?;
        for (sortk, item) in rows {
            handle.put(&sortk, item)?;
        }
        debug!(uid = %uid, ty = %def.name, "graph.node.created");
        Ok(uid)
    }

    /// Type name of `uid`.
    pub fn node_type(&self, uid: Uid) -> Result<String> {
        edge::node_type(&self.ctx(), uid)
    }

    /// Attaches `child` to `parent` under `predicate`.
    ///
    /// Returns every error raised along the way, at most one per task; an
    /// empty list means the edge is attached. A duplicate attach yields a
    /// single [`GraphError::EdgeAlreadyExists`].
    pub fn attach_edge(&self, child: Uid, parent: Uid, predicate: &str) -> Vec<GraphError> {
        edge::attach(&self.ctx(), child, parent, predicate)
    }

    /// Soft-deletes the edge `child` -> `parent` under `predicate`.
    pub fn detach_edge(&self, child: Uid, parent: Uid, predicate: &str) -> Result<()> {
        edge::detach(&self.ctx(), child, parent, predicate)
    }

    /// Live edges of `predicate` on `parent`, with their propagated scalars.
    pub fn children(&self, parent: Uid, predicate: &str) -> Result<AdjacencyView> {
        edge::children(&self.ctx(), parent, predicate)
    }

    /// Shared handle on the rows of `uid` under `prefix`.
    ///
    /// Fails with [`GraphError::NodeNotFound`] when no such row exists.
    pub fn fetch_node(&self, uid: Uid, prefix: &str) -> Result<CacheHandle> {
        let handle = self.cache.lock_for_read(uid, prefix)?;
        if handle.rows_with_prefix(prefix).next().is_none() {
            return Err(GraphError::NodeNotFound(uid));
        }
        Ok(handle)
    }

    /// Exclusive handle on `uid` with `prefix` loaded. The node may have no
    /// rows yet.
    pub fn fetch_for_update(&self, uid: Uid, prefix: &str) -> Result<CacheHandle> {
        self.cache.lock_for_write(uid, prefix)
    }

    /// Starts an [`EdgeScheduler`] that runs attaches against this graph,
    /// admitted through `throttle` with the configured attach ceiling.
    pub fn scheduler(self: &Arc<Self>, throttle: Arc<Throttle>) -> Result<EdgeScheduler> {
        throttle.register(ATTACH_CLASS, self.config.attach_ceiling)?;
        let graph = Arc::clone(self);
        let executor: EdgeExecutor = Arc::new(move |request: &EdgeRequest| {
            graph.attach_edge(request.child, request.parent, &request.predicate)
        });
        Ok(EdgeScheduler::start(throttle, executor))
    }
}
