use persona::config::PersonaConfig;
use persona::db::{self, migrations, Store, StoreKind};
use persona::error::PersonaError;
use persona::memory::queue::{self, NewMessage};
use tempfile::TempDir;

fn disk_config(dir: &TempDir) -> PersonaConfig {
    let mut config = PersonaConfig::default();
    config.storage.db_path = dir.path().join("data").join("persona.db").to_string_lossy().into_owned();
    config.storage.graph_path = dir.path().join("data").join("graph.db").to_string_lossy().into_owned();
    config
}

fn table_names(conn: &rusqlite::Connection) -> Vec<String> {
    conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn open_creates_both_stores_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let config = disk_config(&tmp);
    assert!(!config.resolved_db_path().exists());

    let store = Store::open(&config).unwrap();
    assert!(config.resolved_db_path().exists());
    assert!(config.resolved_graph_path().exists());

    let records = table_names(&store.records().unwrap());
    for table in ["memories", "memory_log", "memory_nodes", "message_queue", "schema_meta"] {
        assert!(records.contains(&table.to_string()), "records store missing {table}");
    }
    let graph = table_names(&store.graph().unwrap());
    for table in ["associations", "cognitive_nodes", "node_merges", "schema_meta"] {
        assert!(graph.contains(&table.to_string()), "graph store missing {table}");
    }
    assert!(!graph.contains(&"memories".to_string()));
}

#[test]
fn wal_and_foreign_keys_enabled() {
    let tmp = TempDir::new().unwrap();
    let conn = db::open_database(tmp.path().join("graph.db"), StoreKind::Graph).unwrap();

    let mode: String = conn.pragma_query_value(None, "journal_mode", |row| row.get(0)).unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
    let fk: i64 = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).unwrap();
    assert_eq!(fk, 1);
}

#[test]
fn reopen_is_idempotent_and_keeps_data() {
    let tmp = TempDir::new().unwrap();
    let config = disk_config(&tmp);
    {
        let store = Store::open(&config).unwrap();
        let message = NewMessage {
            conversation_id: "g1".into(),
            sender_id: "u1".into(),
            sender_name: "alice".into(),
            content: "hello".into(),
            is_priority: false,
        };
        queue::enqueue(&store.records().unwrap(), &message, &config.queue, chrono::Utc::now()).unwrap();
    }

    let store = Store::open(&config).unwrap();
    let records = store.records().unwrap();
    assert_eq!(queue::pending_count(&records, "g1").unwrap(), 1);
    assert_eq!(
        migrations::get_schema_version(&records).unwrap(),
        migrations::CURRENT_SCHEMA_VERSION
    );
}

#[test]
fn newer_schema_is_refused() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("persona.db");
    {
        let conn = db::open_database(&path, StoreKind::Records).unwrap();
        conn.execute(
            "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
            [(migrations::CURRENT_SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();
    }

    let err = db::open_database(&path, StoreKind::Records).unwrap_err();
    assert!(matches!(err, PersonaError::Config(_)));
    assert!(err.to_string().contains("newer"));
}

#[test]
fn interrupted_entries_return_to_pending_on_open() {
    let tmp = TempDir::new().unwrap();
    let config = disk_config(&tmp);
    {
        let store = Store::open(&config).unwrap();
        let records = store.records().unwrap();
        let message = NewMessage {
            conversation_id: "g1".into(),
            sender_id: "u1".into(),
            sender_name: "alice".into(),
            content: "hello".into(),
            is_priority: false,
        };
        queue::enqueue(&records, &message, &config.queue, chrono::Utc::now()).unwrap();
        let claimed = queue::drain_batch(&records, "g1", 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue::pending_count(&records, "g1").unwrap(), 0);
    }

    let store = Store::open(&config).unwrap();
    let stats = queue::queue_stats(&store.records().unwrap(), Some("g1")).unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn memory_backend_has_no_files() {
    let mut config = PersonaConfig::default();
    config.storage.backend = "memory".into();
    let store = Store::open(&config).unwrap();
    assert!(store.paths().is_none());
    assert!(store.records().is_ok());
}
