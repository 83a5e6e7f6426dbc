//! Process-wide coordinator installation.

mod common;

use std::sync::Arc;

use common::{fake_clients, test_config, FakeBackend, FakeCluster};
use strata_coordinator::{Coordinator, SchemaLockManager};

fn build() -> Coordinator {
    let config = test_config();
    let cluster = Arc::new(FakeCluster::default());
    let clients = fake_clients(&cluster, &config);
    let backend = Arc::new(FakeBackend::new(Arc::new(SchemaLockManager::new())));
    Coordinator::new(config, backend, clients).expect("coordinator")
}

#[test]
fn only_the_first_install_wins() {
    assert!(Coordinator::global().is_none());
    let installed = Coordinator::install(build()).expect("first install");
    let global = Coordinator::global().expect("installed");
    assert!(Arc::ptr_eq(&installed, global));

    let err = Coordinator::install(build()).unwrap_err();
    assert!(err.to_string().contains("already installed"));
    assert!(Arc::ptr_eq(&installed, Coordinator::global().expect("still installed")));

    let id = global.create_query_id();
    assert_eq!(id.data_node_id, 7);
}
