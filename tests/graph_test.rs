mod helpers;

use std::thread;

use helpers::{t0, test_store};
use persona::config::NodeConfig;
use persona::db::{self, StoreKind};
use persona::error::PersonaError;
use persona::memory::graph;
use persona::memory::types::Scope;
use tempfile::TempDir;

#[test]
fn concurrent_upserts_yield_one_node_per_name() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("graph.db");
    db::open_database(&path, StoreKind::Graph).unwrap();

    let connections: Vec<_> = (0..4)
        .map(|_| db::open_database(&path, StoreKind::Graph).unwrap())
        .collect();
    let workers: Vec<_> = connections
        .into_iter()
        .map(|conn| {
            thread::spawn(move || {
                let config = NodeConfig::default();
                let scope = Scope::conversation("g1");
                for i in 0..25 {
                    let name = if i % 2 == 0 { "Cats" } else { "cats " };
                    graph::upsert_node(&conn, &scope, name, &config, t0()).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let conn = db::open_database(&path, StoreKind::Graph).unwrap();
    let nodes = graph::list_nodes(&conn, Some(&Scope::conversation("g1")), 10).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name_key, "cats");
    // 100 mentions saturate at the cap
    assert_eq!(nodes[0].activation, NodeConfig::default().max_activation);
}

#[test]
fn same_name_in_different_scopes_is_distinct() {
    let store = test_store();
    let conn = store.graph().unwrap();
    let config = NodeConfig::default();

    let a = graph::upsert_node(&conn, &Scope::conversation("g1"), "cats", &config, t0()).unwrap();
    let b = graph::upsert_node(&conn, &Scope::conversation("g2"), "cats", &config, t0()).unwrap();
    let shared = graph::upsert_node(&conn, &Scope::Shared, "cats", &config, t0()).unwrap();
    assert_ne!(a.id, b.id);
    assert_ne!(a.id, shared.id);
    assert_eq!(graph::list_nodes(&conn, None, 10).unwrap().len(), 3);
}

#[test]
fn repeated_co_occurrence_saturates_below_cap() {
    let store = test_store();
    let mut conn = store.graph().unwrap();
    let config = NodeConfig::default();
    let scope = Scope::conversation("g1");
    let cats = graph::upsert_node(&conn, &scope, "cats", &config, t0()).unwrap();
    let dogs = graph::upsert_node(&conn, &scope, "dogs", &config, t0()).unwrap();

    let ids = vec![cats.id.clone(), dogs.id.clone()];
    let mut previous = 0.0;
    for _ in 0..50 {
        graph::link_co_occurrence(&mut conn, &ids, config.association_delta, &config, t0()).unwrap();
        let edge = graph::get_association(&conn, &cats.id, &dogs.id).unwrap().unwrap();
        assert!(edge.strength >= previous);
        assert!(edge.strength <= config.max_strength);
        previous = edge.strength;
    }
    let back = graph::get_association(&conn, &dogs.id, &cats.id).unwrap().unwrap();
    assert_eq!(back.strength, previous);
}

#[test]
fn permanent_node_needs_force_delete() {
    let store = test_store();
    let mut conn = store.graph().unwrap();
    let config = NodeConfig::default();
    let scope = Scope::conversation("g1");
    let node = graph::upsert_node(&conn, &scope, "alice", &config, t0()).unwrap();
    let other = graph::upsert_node(&conn, &scope, "bob", &config, t0()).unwrap();
    graph::upsert_association(&conn, &node.id, &other.id, 0.3, &config, t0()).unwrap();
    graph::mark_permanent(&conn, &node.id, true).unwrap();

    let err = graph::delete_node(&mut conn, &node.id).unwrap_err();
    assert!(matches!(err, PersonaError::PermanentEntity { .. }));

    graph::force_delete_node(&mut conn, &node.id).unwrap();
    assert!(graph::get_node(&conn, &node.id).unwrap_err().is_not_found());
    assert!(graph::get_association(&conn, &node.id, &other.id).unwrap().is_none());
}
