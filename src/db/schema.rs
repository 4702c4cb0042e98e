//! SQL DDL for the two logical stores.
//!
//! The relational store holds `message_queue`, `memories`, `memory_nodes`,
//! `memory_log` and `schema_meta`. The graph store holds `cognitive_nodes`,
//! `associations`, `node_merges` and its own `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

use crate::memory::repair;

const RECORDS_SQL: &str = r#"
-- Short-term memory: every chat message, pending until a batch consumes it
CREATE TABLE IF NOT EXISTS message_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    sender_name TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    arrived_at TEXT NOT NULL,
    priority TEXT NOT NULL CHECK(priority IN ('immediate','batched')),
    state TEXT NOT NULL DEFAULT 'pending' CHECK(state IN ('pending','in_flight','processed','dropped')),
    attempts INTEGER NOT NULL DEFAULT 0,
    is_bot INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_conv_state ON message_queue(conversation_id, state, id);

-- Long-term memory records
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    content TEXT NOT NULL,
    weight REAL NOT NULL CHECK(weight >= 0.0 AND weight <= 1.0),
    permanent INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    decayed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_conv_created ON memories(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_memories_weight ON memories(weight);

-- Links into the graph store; node_id is not a foreign key (separate database)
CREATE TABLE IF NOT EXISTS memory_nodes (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    node_id TEXT NOT NULL,
    PRIMARY KEY (memory_id, node_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_nodes_node ON memory_nodes(node_id);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','reinforce','decay','delete','prune','drop','repair','admin')),
    target_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const GRAPH_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cognitive_nodes (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    name_key TEXT NOT NULL,
    activation REAL NOT NULL CHECK(activation >= 0.0),
    permanent INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    decayed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_scope_activation ON cognitive_nodes(scope, activation);

CREATE TABLE IF NOT EXISTS associations (
    source_id TEXT NOT NULL REFERENCES cognitive_nodes(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES cognitive_nodes(id) ON DELETE CASCADE,
    strength REAL NOT NULL CHECK(strength >= 0.0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    decayed_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id),
    CHECK(source_id <> target_id)
);

CREATE INDEX IF NOT EXISTS idx_associations_target ON associations(target_id);

-- Where merged duplicate nodes went, so memory links can follow them
CREATE TABLE IF NOT EXISTS node_merges (
    merged_id TEXT PRIMARY KEY,
    keeper_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Created after duplicates are merged, so imported graphs with duplicate
/// names still open.
const GRAPH_UNIQUE_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_scope_name ON cognitive_nodes(scope, name_key);";

/// Initialize the relational store. Idempotent.
pub fn init_records_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(RECORDS_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    Ok(())
}

/// Initialize the graph store. Idempotent.
pub fn init_graph_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(GRAPH_SQL)?;
    let merged = repair::merge_duplicate_nodes(conn)?;
    if merged > 0 {
        tracing::warn!(merged, "merged duplicate cognitive nodes before indexing");
    }
    conn.execute_batch(GRAPH_UNIQUE_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn records_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_records_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for t in ["message_queue", "memories", "memory_nodes", "memory_log", "schema_meta"] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }

    #[test]
    fn graph_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_graph_schema(&conn).unwrap();

        let tables = table_names(&conn);
        assert!(tables.contains(&"cognitive_nodes".to_string()));
        assert!(tables.contains(&"associations".to_string()));
        assert!(tables.contains(&"node_merges".to_string()));
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_records_schema(&conn).unwrap();
        init_records_schema(&conn).unwrap();

        let graph = Connection::open_in_memory().unwrap();
        init_graph_schema(&graph).unwrap();
        init_graph_schema(&graph).unwrap();
    }

    #[test]
    fn self_association_rejected_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_graph_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO cognitive_nodes (id, scope, name, name_key, activation, created_at, last_accessed, decayed_at) \
             VALUES ('n1', 'g1', 'cats', 'cats', 1.0, 't', 't', 't')",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO associations (source_id, target_id, strength, created_at, updated_at, decayed_at) \
             VALUES ('n1', 'n1', 0.3, 't', 't', 't')",
            [],
        );
        assert!(result.is_err());
    }
}
