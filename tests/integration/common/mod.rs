#![allow(dead_code)]

use std::sync::{Arc, Once};

use rowgraph::storage::sortkey;
use rowgraph::{
    AttrDef, CounterMetrics, DataItem, DataKind, Graph, GraphConfig, MemoryStore, ScalarValue,
    SortKey, TypeCatalog, TypeDef, Uid,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("rowgraph=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}

pub fn catalog() -> TypeCatalog {
    TypeCatalog::new()
        .with_type(
            TypeDef::new("Person", "P")
                .attr(AttrDef::scalar("Name", "N", DataKind::String).propagated())
                .attr(AttrDef::scalar("Age", "A", DataKind::Int).propagated())
                .attr(AttrDef::scalar("Email", "E", DataKind::String))
                .attr(AttrDef::uid_pred("Friends", "F", "Person")),
        )
        .unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<CounterMetrics>,
    pub graph: Arc<Graph>,
}

impl Harness {
    pub fn new(config: GraphConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }

    pub fn with_store(store: MemoryStore, config: GraphConfig) -> Self {
        init_tracing();
        let store = Arc::new(store);
        let metrics = Arc::new(CounterMetrics::default());
        let graph = Graph::new(store.clone(), catalog(), config).with_metrics(metrics.clone());
        Self {
            store,
            metrics,
            graph: Arc::new(graph),
        }
    }

    pub fn person(&self, name: &str, age: i64) -> Uid {
        self.graph
            .create_node(
                "Person",
                &[
                    ("Name", ScalarValue::Str(name.to_string())),
                    ("Age", ScalarValue::Int(age)),
                ],
            )
            .unwrap()
    }

    pub fn adjacency(&self, parent: Uid) -> DataItem {
        self.store.row(parent, &adj()).unwrap_or_default()
    }

    pub fn reverse(&self, child: Uid) -> DataItem {
        self.store
            .row(child, &sortkey::reverse_row())
            .unwrap_or_default()
    }
}

pub fn adj() -> SortKey {
    sortkey::adjacency("A", "F")
}
