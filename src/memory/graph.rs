//! Cognitive node graph: keyword nodes and weighted directed associations.
//!
//! Node upserts are single `INSERT ... ON CONFLICT` statements against the
//! `(scope, name_key)` unique index, so concurrent extraction for the same
//! conversation can never create two nodes for one name.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::config::NodeConfig;
use crate::error::{or_not_found, EntityKind, PersonaError, Result};
use crate::memory::types::{format_timestamp, name_key, Association, CognitiveNode, Scope};

const NODE_COLUMNS: &str =
    "id, scope, name, name_key, activation, permanent, created_at, last_accessed, decayed_at, rowid";

const ASSOCIATION_COLUMNS: &str = "source_id, target_id, strength, created_at, updated_at, decayed_at";

fn node_from_row(row: &Row) -> rusqlite::Result<CognitiveNode> {
    Ok(CognitiveNode {
        id: row.get(0)?,
        scope: Scope::conversation(row.get::<_, String>(1)?),
        name: row.get(2)?,
        name_key: row.get(3)?,
        activation: row.get(4)?,
        permanent: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        last_accessed: row.get(7)?,
        decayed_at: row.get(8)?,
        seq: row.get(9)?,
    })
}

fn association_from_row(row: &Row) -> rusqlite::Result<Association> {
    Ok(Association {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        strength: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        decayed_at: row.get(5)?,
    })
}

/// Diminishing-returns strength update: `s + delta * (1 - s / max)`, capped at `max`.
///
/// Two equal updates from zero give `2δ - δ²/max`, never `2δ`.
pub fn saturate(current: f64, delta: f64, max: f64) -> f64 {
    let headroom = (1.0 - current / max).max(0.0);
    (current + delta * headroom).min(max)
}

/// Create a node or boost an existing one with the same case-folded name in scope.
pub fn upsert_node(
    conn: &Connection,
    scope: &Scope,
    name: &str,
    config: &NodeConfig,
    now: DateTime<Utc>,
) -> Result<CognitiveNode> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PersonaError::InvalidInput("node name is empty".into()));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let ts = format_timestamp(now);

    let node = conn.query_row(
        &format!(
            "INSERT INTO cognitive_nodes (id, scope, name, name_key, activation, permanent, created_at, last_accessed, decayed_at) \
             VALUES (?1, ?2, ?3, ?4, MIN(?5, ?7), 0, ?8, ?8, ?8) \
             ON CONFLICT(scope, name_key) DO UPDATE SET \
               activation = MIN(activation + ?6, ?7), \
               last_accessed = excluded.last_accessed, \
               decayed_at = excluded.decayed_at \
             RETURNING {NODE_COLUMNS}"
        ),
        params![
            id,
            scope.as_key(),
            name,
            name_key(name),
            config.initial_activation,
            config.activation_boost,
            config.max_activation,
            ts
        ],
        node_from_row,
    )?;

    tracing::debug!(node = %node.id, name = %node.name, activation = node.activation, "upserted node");
    Ok(node)
}

/// Admin creation. An existing node with the same name is returned as is,
/// apart from gaining permanence when asked; it is never boosted.
pub fn create_node(
    conn: &Connection,
    scope: &Scope,
    name: &str,
    activation: Option<f64>,
    permanent: bool,
    config: &NodeConfig,
    now: DateTime<Utc>,
) -> Result<CognitiveNode> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PersonaError::InvalidInput("node name is empty".into()));
    }
    let activation = activation.unwrap_or(config.initial_activation);
    if !activation.is_finite() || activation < 0.0 {
        return Err(PersonaError::InvalidInput(format!(
            "activation must be a non-negative number, got {activation}"
        )));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let ts = format_timestamp(now);
    let node = conn.query_row(
        &format!(
            "INSERT INTO cognitive_nodes (id, scope, name, name_key, activation, permanent, created_at, last_accessed, decayed_at) \
             VALUES (?1, ?2, ?3, ?4, MIN(?5, ?6), ?7, ?8, ?8, ?8) \
             ON CONFLICT(scope, name_key) DO UPDATE SET permanent = MAX(permanent, excluded.permanent) \
             RETURNING {NODE_COLUMNS}"
        ),
        params![
            id,
            scope.as_key(),
            name,
            name_key(name),
            activation,
            config.max_activation,
            permanent,
            ts
        ],
        node_from_row,
    )?;

    tracing::info!(node = %node.id, name = %node.name, scope = %scope, permanent = node.permanent, "created node");
    Ok(node)
}

pub fn get_node(conn: &Connection, id: &str) -> Result<CognitiveNode> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM cognitive_nodes WHERE id = ?1"),
        params![id],
        node_from_row,
    )
    .map_err(|e| or_not_found(e, EntityKind::Node, id))
}

/// Look a node up by name within one scope.
pub fn find_node(conn: &Connection, scope: &Scope, name: &str) -> Result<Option<CognitiveNode>> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM cognitive_nodes WHERE scope = ?1 AND name_key = ?2"),
            params![scope.as_key(), name_key(name)],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

/// Highest-activation nodes in a scope. Ties go to the most recently accessed, then the oldest.
pub fn get_top_nodes(conn: &Connection, scope: &Scope, limit: usize) -> Result<Vec<CognitiveNode>> {
    let nodes = conn
        .prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM cognitive_nodes WHERE scope = ?1 \
             ORDER BY activation DESC, last_accessed DESC, rowid ASC LIMIT ?2"
        ))?
        .query_map(params![scope.as_key(), limit as i64], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// All nodes in a scope, or in every scope when `scope` is `None`, in creation order.
pub fn list_nodes(conn: &Connection, scope: Option<&Scope>, limit: usize) -> Result<Vec<CognitiveNode>> {
    let nodes = conn
        .prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM cognitive_nodes WHERE ?1 IS NULL OR scope = ?1 \
             ORDER BY rowid ASC LIMIT ?2"
        ))?
        .query_map(params![scope.map(Scope::as_key), limit as i64], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Every node in any of the given scopes.
pub fn nodes_in_scopes(conn: &Connection, scopes: &[Scope]) -> Result<Vec<CognitiveNode>> {
    if scopes.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; scopes.len()].join(", ");
    let nodes = conn
        .prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM cognitive_nodes WHERE scope IN ({placeholders}) ORDER BY rowid"
        ))?
        .query_map(params_from_iter(scopes.iter().map(Scope::as_key)), node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Administrative edit. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub activation: Option<f64>,
    pub permanent: Option<bool>,
}

/// Apply an admin edit. Does not touch the decay clock.
pub fn update_node(conn: &Connection, id: &str, update: &NodeUpdate) -> Result<CognitiveNode> {
    let current = get_node(conn, id)?;

    let name = match &update.name {
        Some(n) if n.trim().is_empty() => {
            return Err(PersonaError::InvalidInput("node name is empty".into()))
        }
        Some(n) => n.trim().to_string(),
        None => current.name.clone(),
    };
    let activation = update.activation.unwrap_or(current.activation);
    if !activation.is_finite() || activation < 0.0 {
        return Err(PersonaError::InvalidInput(format!(
            "activation must be a non-negative number, got {activation}"
        )));
    }

    let key = name_key(&name);
    if key != current.name_key {
        if let Some(existing) = find_node(conn, &current.scope, &name)? {
            return Err(PersonaError::InvalidInput(format!(
                "a node named {:?} already exists in this scope ({})",
                existing.name, existing.id
            )));
        }
    }

    conn.execute(
        "UPDATE cognitive_nodes SET name = ?2, name_key = ?3, activation = ?4, permanent = ?5 WHERE id = ?1",
        params![
            id,
            name,
            key,
            activation,
            update.permanent.unwrap_or(current.permanent)
        ],
    )?;
    get_node(conn, id)
}

pub fn mark_permanent(conn: &Connection, id: &str, permanent: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE cognitive_nodes SET permanent = ?2 WHERE id = ?1",
        params![id, permanent],
    )?;
    if updated == 0 {
        return Err(PersonaError::not_found(EntityKind::Node, id));
    }
    Ok(())
}

/// Delete a node and its edges. Permanent nodes are refused.
pub fn delete_node(conn: &mut Connection, id: &str) -> Result<()> {
    let node = get_node(conn, id)?;
    if node.permanent {
        return Err(PersonaError::PermanentEntity {
            kind: EntityKind::Node,
            id: id.to_string(),
        });
    }
    force_delete_node(conn, id)
}

/// Delete a node and its edges regardless of permanence.
pub fn force_delete_node(conn: &mut Connection, id: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM associations WHERE source_id = ?1 OR target_id = ?1",
        params![id],
    )?;
    let deleted = tx.execute("DELETE FROM cognitive_nodes WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(PersonaError::not_found(EntityKind::Node, id));
    }
    tx.commit()?;
    Ok(())
}

fn ensure_node(conn: &Connection, id: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM cognitive_nodes WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(PersonaError::not_found(EntityKind::Node, id)),
    }
}

/// Create the edge `source -> target` or strengthen it with [`saturate`].
pub fn upsert_association(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    delta: f64,
    config: &NodeConfig,
    now: DateTime<Utc>,
) -> Result<Association> {
    if source_id == target_id {
        return Err(PersonaError::InvalidInput(format!(
            "a node cannot be associated with itself ({source_id})"
        )));
    }
    if !delta.is_finite() || delta <= 0.0 {
        return Err(PersonaError::InvalidInput(format!(
            "association delta must be positive, got {delta}"
        )));
    }
    ensure_node(conn, source_id)?;
    ensure_node(conn, target_id)?;

    let ts = format_timestamp(now);
    let association = conn.query_row(
        &format!(
            "INSERT INTO associations (source_id, target_id, strength, created_at, updated_at, decayed_at) \
             VALUES (?1, ?2, MIN(?3, ?4), ?5, ?5, ?5) \
             ON CONFLICT(source_id, target_id) DO UPDATE SET \
               strength = MIN(?4, strength + ?3 * MAX(0.0, 1.0 - strength / ?4)), \
               updated_at = excluded.updated_at, \
               decayed_at = excluded.decayed_at \
             RETURNING {ASSOCIATION_COLUMNS}"
        ),
        params![source_id, target_id, delta, config.max_strength, ts],
        association_from_row,
    )?;
    Ok(association)
}

/// Strengthen both directions for every unordered pair. Returns the number of edges touched.
pub fn link_co_occurrence(
    conn: &mut Connection,
    node_ids: &[String],
    delta: f64,
    config: &NodeConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut ids: Vec<&str> = node_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();

    let tx = conn.transaction()?;
    let mut touched = 0;
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            upsert_association(&tx, a, b, delta, config, now)?;
            upsert_association(&tx, b, a, delta, config, now)?;
            touched += 2;
        }
    }
    tx.commit()?;
    Ok(touched)
}

pub fn get_association(conn: &Connection, source_id: &str, target_id: &str) -> Result<Option<Association>> {
    let association = conn
        .query_row(
            &format!("SELECT {ASSOCIATION_COLUMNS} FROM associations WHERE source_id = ?1 AND target_id = ?2"),
            params![source_id, target_id],
            association_from_row,
        )
        .optional()?;
    Ok(association)
}

/// Outgoing edges of a node with their targets, strongest first.
pub fn neighbors(conn: &Connection, id: &str, limit: usize) -> Result<Vec<(Association, CognitiveNode)>> {
    let prefixed: String = NODE_COLUMNS
        .split(", ")
        .map(|c| format!("n.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = conn
        .prepare(&format!(
            "SELECT a.source_id, a.target_id, a.strength, a.created_at, a.updated_at, a.decayed_at, {prefixed} \
             FROM associations a JOIN cognitive_nodes n ON n.id = a.target_id \
             WHERE a.source_id = ?1 \
             ORDER BY a.strength DESC, n.rowid ASC LIMIT ?2"
        ))?
        .query_map(params![id, limit as i64], |row| {
            let association = association_from_row(row)?;
            let node = CognitiveNode {
                id: row.get(6)?,
                scope: Scope::conversation(row.get::<_, String>(7)?),
                name: row.get(8)?,
                name_key: row.get(9)?,
                activation: row.get(10)?,
                permanent: row.get::<_, i64>(11)? != 0,
                created_at: row.get(12)?,
                last_accessed: row.get(13)?,
                decayed_at: row.get(14)?,
                seq: row.get(15)?,
            };
            Ok((association, node))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Administrative strength override on an existing edge.
pub fn set_association_strength(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    strength: f64,
    now: DateTime<Utc>,
) -> Result<Association> {
    if !strength.is_finite() || strength < 0.0 {
        return Err(PersonaError::InvalidInput(format!(
            "strength must be a non-negative number, got {strength}"
        )));
    }
    let updated = conn.execute(
        "UPDATE associations SET strength = ?3, updated_at = ?4 WHERE source_id = ?1 AND target_id = ?2",
        params![source_id, target_id, strength, format_timestamp(now)],
    )?;
    if updated == 0 {
        return Err(PersonaError::not_found(
            EntityKind::Association,
            format!("{source_id}->{target_id}"),
        ));
    }
    get_association(conn, source_id, target_id)?.ok_or_else(|| {
        PersonaError::not_found(EntityKind::Association, format!("{source_id}->{target_id}"))
    })
}

pub fn delete_association(conn: &Connection, source_id: &str, target_id: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM associations WHERE source_id = ?1 AND target_id = ?2",
        params![source_id, target_id],
    )?;
    if deleted == 0 {
        return Err(PersonaError::not_found(
            EntityKind::Association,
            format!("{source_id}->{target_id}"),
        ));
    }
    Ok(())
}
