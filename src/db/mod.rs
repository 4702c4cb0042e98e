pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::PersonaConfig;
use crate::error::{PersonaError, Result};

/// How long a writer waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which logical store a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Records,
    Graph,
}

fn init(conn: &mut Connection, kind: StoreKind) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    match kind {
        StoreKind::Records => schema::init_records_schema(conn)?,
        StoreKind::Graph => schema::init_graph_schema(conn)?,
    }
    migrations::run_migrations(conn)?;
    Ok(())
}

/// Open (or create) one store at the given path with schema initialized.
pub fn open_database(path: impl AsRef<Path>, kind: StoreKind) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            PersonaError::Config(format!("failed to create directory {}: {e}", parent.display()))
        })?;
    }

    let mut conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL lets the scheduler read while a message handler writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    init(&mut conn, kind)?;

    tracing::info!(path = %path.display(), store = ?kind, "database initialized");
    Ok(conn)
}

/// Open an in-memory store.
pub fn open_memory_database(kind: StoreKind) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    init(&mut conn, kind)?;
    Ok(conn)
}

/// Both logical stores behind one handle.
///
/// Each connection sits behind its own mutex. Whenever both are needed the
/// graph lock is taken first, then the records lock.
#[derive(Clone)]
pub struct Store {
    graph: Arc<Mutex<Connection>>,
    records: Arc<Mutex<Connection>>,
    paths: Option<(PathBuf, PathBuf)>,
}

impl Store {
    /// Open the stores selected by `storage.backend`.
    pub fn open(config: &PersonaConfig) -> Result<Self> {
        let store = match config.storage.backend.as_str() {
            "sqlite" => {
                let records_path = config.resolved_db_path();
                let graph_path = config.resolved_graph_path();
                let records = open_database(&records_path, StoreKind::Records)?;
                let graph = open_database(&graph_path, StoreKind::Graph)?;
                let mut store = Self::from_connections(graph, records);
                store.paths = Some((records_path, graph_path));
                store
            }
            "memory" => Self::open_in_memory()?,
            other => {
                return Err(PersonaError::Config(format!(
                    "unknown storage backend: {other}"
                )))
            }
        };

        let recovered = {
            let conn = store.records()?;
            crate::memory::queue::recover_in_flight(&conn)?
        };
        if recovered > 0 {
            tracing::warn!(recovered, "returned interrupted queue entries to pending");
        }
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connections(
            open_memory_database(StoreKind::Graph)?,
            open_memory_database(StoreKind::Records)?,
        ))
    }

    pub fn from_connections(graph: Connection, records: Connection) -> Self {
        Self {
            graph: Arc::new(Mutex::new(graph)),
            records: Arc::new(Mutex::new(records)),
            paths: None,
        }
    }

    /// File paths of (records, graph), `None` for in-memory stores.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        self.paths.as_ref().map(|(r, g)| (r.as_path(), g.as_path()))
    }

    pub fn graph(&self) -> Result<MutexGuard<'_, Connection>> {
        self.graph
            .lock()
            .map_err(|e| PersonaError::LockPoisoned(format!("graph store: {e}")))
    }

    pub fn records(&self) -> Result<MutexGuard<'_, Connection>> {
        self.records
            .lock()
            .map_err(|e| PersonaError::LockPoisoned(format!("records store: {e}")))
    }

    /// Run blocking work against both stores off the async executor.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut graph = store.graph()?;
            let mut records = store.records()?;
            f(&mut graph, &mut records)
        })
        .await
        .map_err(|e| PersonaError::Task(format!("db task failed: {e}")))?
    }

    /// Run blocking work against the relational store only.
    pub async fn run_records<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut records = store.records()?;
            f(&mut records)
        })
        .await
        .map_err(|e| PersonaError::Task(format!("db task failed: {e}")))?
    }

    /// Run blocking work against the graph store only.
    pub async fn run_graph<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut graph = store.graph()?;
            f(&mut graph)
        })
        .await
        .map_err(|e| PersonaError::Task(format!("db task failed: {e}")))?
    }
}
