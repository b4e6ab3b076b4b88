#![allow(dead_code)]

use std::sync::Arc;
use strand_core::{ContentStore, InMemoryCatalog, Resolver};
use strand_schema::{Environment, Marker, PackageName, Requirement, Version};
use tempfile::TempDir;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A temporary cache directory with a store opened on it.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub store: Arc<ContentStore>,
}

impl TestContext {
    pub async fn new() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let store = ContentStore::open(temp_dir.path().join("cache"))
            .await
            .expect("failed to open store");
        Self {
            temp_dir,
            store: Arc::new(store),
        }
    }
}

pub fn env(s: &str) -> Environment {
    Environment::parse(s).expect("bad environment")
}

pub fn linux() -> Environment {
    env("3.11-linux-x86_64")
}

pub fn macos() -> Environment {
    env("3.13-macos-aarch64")
}

pub fn req(s: &str) -> Requirement {
    Requirement::parse(s).expect("bad requirement")
}

pub fn reqs(items: &[&str]) -> Vec<Requirement> {
    items.iter().map(|s| req(s)).collect()
}

pub fn name(s: &str) -> PackageName {
    PackageName::new(s)
}

pub fn v(s: &str) -> Version {
    Version::parse(s).expect("bad version")
}

pub fn marker(s: &str) -> Marker {
    Marker::parse(s).expect("bad marker")
}

/// A1.0 requires B<2.0; B1.0 and B2.5 exist.
pub fn ab_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.publish("a", "1.0", &["b<2.0"]).unwrap();
    catalog.publish("b", "1.0", &[]).unwrap();
    catalog.publish("b", "2.5", &[]).unwrap();
    catalog
}

pub fn resolver(catalog: InMemoryCatalog) -> Resolver {
    init_tracing();
    Resolver::new(Arc::new(catalog))
}
