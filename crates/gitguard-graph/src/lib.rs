//! The knowledge graph store.
//!
//! Nodes and edges live as SQLite rows with id references; there are no
//! in-memory pointer cycles, and traversal is an iterative BFS with an
//! explicit visited set bounded by depth. Writers serialize through a single
//! connection behind a mutex; WAL mode keeps readers unblocked.
//!
//! Uniqueness is enforced by the schema: one row per `(ntype, nkey)`, one
//! edge per `(src, dst, rel)`. Concurrent upserts of the same key converge
//! on a single row.
//!
//! # Example
//!
//! ```
//! use gitguard_graph::GraphStore;
//! use gitguard_types::{NodeType, RelKind};
//! use serde_json::json;
//!
//! let td = tempfile::tempdir().expect("tempdir");
//! let store = GraphStore::open(td.path().join("graph.db")).expect("open");
//!
//! let pr = store.upsert_node(NodeType::Pr, "acme/widgets#1", "docs: add install", json!({})).expect("node");
//! let file = store.upsert_node(NodeType::File, "README.md", "README.md", json!({})).expect("node");
//! store.upsert_edge(pr, file, RelKind::Touches, json!({})).expect("edge");
//!
//! let (nodes, edges) = store.neighbors(pr, None, 1, None).expect("bfs");
//! assert_eq!(nodes.len(), 2);
//! assert_eq!(edges.len(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use gitguard_types::{
    KgEdge, KgNode, NodeType, OwnerEntry, OwnerKind, OwnersIndex, RelKind,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// Default BFS depth bound.
pub const DEFAULT_DEPTH: usize = 2;

/// Half-life, in days, for the owner activity decay.
const ACTIVITY_HALF_LIFE_DAYS: f64 = 30.0;

/// Declarative ownership patterns, loaded from a TOML file.
///
/// ```toml
/// [[pattern]]
/// path = "src/auth/"
/// owners = ["team:security", "alice"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnershipPatterns {
    #[serde(default, rename = "pattern")]
    pub patterns: Vec<OwnershipPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipPattern {
    /// Path prefix the owners claim.
    pub path: String,
    /// Owner names; `team:` prefix marks a team.
    pub owners: Vec<String>,
}

impl OwnershipPatterns {
    /// Load patterns from a TOML file. A missing file is an empty set: the
    /// owners index then derives purely from graph activity.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ownership patterns {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse ownership patterns {}", path.display()))
    }
}

/// SQLite-backed graph store.
pub struct GraphStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl GraphStore {
    /// Open (and initialize if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create graph dir {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open graph store {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id         INTEGER PRIMARY KEY,
                ntype      TEXT NOT NULL,
                nkey       TEXT NOT NULL,
                title      TEXT NOT NULL,
                data       TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (ntype, nkey)
            );
            CREATE TABLE IF NOT EXISTS edges (
                src        INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                dst        INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                rel        TEXT NOT NULL,
                data       TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE (src, dst, rel)
            );
            CREATE TABLE IF NOT EXISTS portal_pages (
                page_key     TEXT PRIMARY KEY,
                generated_at TEXT NOT NULL,
                sample_id    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_ntype ON nodes(ntype);
            CREATE INDEX IF NOT EXISTS idx_nodes_nkey  ON nodes(nkey);
            CREATE INDEX IF NOT EXISTS idx_edges_rel   ON edges(rel);
            CREATE INDEX IF NOT EXISTS idx_edges_src   ON edges(src);
            CREATE INDEX IF NOT EXISTS idx_edges_dst   ON edges(dst);",
        )
        .context("failed to initialize graph schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Store file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cheap liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("graph store ping failed")?;
        Ok(())
    }

    /// Insert or update a node; returns its id.
    ///
    /// Conflict on `(ntype, nkey)` updates `title`, `data`, `updated_at` and
    /// leaves `created_at` alone.
    pub fn upsert_node(
        &self,
        ntype: NodeType,
        nkey: &str,
        title: &str,
        data: serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("graph lock poisoned");
        let id = conn
            .query_row(
                "INSERT INTO nodes (ntype, nkey, title, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (ntype, nkey) DO UPDATE
                    SET title = excluded.title,
                        data = excluded.data,
                        updated_at = excluded.updated_at
                 RETURNING id",
                params![ntype.as_str(), nkey, title, data.to_string(), now],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to upsert node {}:{}", ntype, nkey))?;
        Ok(id)
    }

    /// Insert or update an edge. Conflict on `(src, dst, rel)` updates
    /// `data`. Referencing a missing node is a constraint violation.
    pub fn upsert_edge(
        &self,
        src: i64,
        dst: i64,
        rel: RelKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.execute(
            "INSERT INTO edges (src, dst, rel, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (src, dst, rel) DO UPDATE SET data = excluded.data",
            params![src, dst, rel.as_str(), data.to_string(), now],
        )
        .with_context(|| format!("failed to upsert edge {} -{}-> {}", src, rel, dst))?;
        Ok(())
    }

    /// Fetch a node by `(ntype, nkey)`.
    pub fn get_node(&self, ntype: NodeType, nkey: &str) -> Result<Option<KgNode>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.query_row(
            "SELECT id, ntype, nkey, title, data, created_at, updated_at
             FROM nodes WHERE ntype = ?1 AND nkey = ?2",
            params![ntype.as_str(), nkey],
            row_to_node,
        )
        .optional()
        .context("failed to read node")
    }

    /// Fetch a node by id.
    pub fn node_by_id(&self, id: i64) -> Result<Option<KgNode>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.query_row(
            "SELECT id, ntype, nkey, title, data, created_at, updated_at
             FROM nodes WHERE id = ?1",
            params![id],
            row_to_node,
        )
        .optional()
        .context("failed to read node")
    }

    /// Remove a node and every incident edge.
    pub fn delete_cascade(&self, ntype: NodeType, nkey: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let deleted = conn
            .execute(
                "DELETE FROM nodes WHERE ntype = ?1 AND nkey = ?2",
                params![ntype.as_str(), nkey],
            )
            .context("failed to delete node")?;
        Ok(deleted > 0)
    }

    /// Bounded BFS from `start`, both edge directions.
    ///
    /// Returns the visited nodes and the edges between them. Traversal is
    /// deterministic: the frontier expands in `(ntype, nkey)` order, and
    /// `max_nodes` (if given) cuts the result after that ordering, so ties
    /// always break the same way.
    pub fn neighbors(
        &self,
        start: i64,
        rel: Option<RelKind>,
        depth: usize,
        max_nodes: Option<usize>,
    ) -> Result<(Vec<KgNode>, Vec<KgEdge>)> {
        // Hard ceiling regardless of caller-supplied depth.
        let depth = depth.min(8);
        let Some(start_node) = self.node_by_id(start)? else {
            bail!("node {} not found", start);
        };

        let mut visited: BTreeSet<i64> = BTreeSet::new();
        let mut nodes: Vec<KgNode> = Vec::new();
        let mut queue: VecDeque<(i64, usize)> = VecDeque::new();
        visited.insert(start);
        nodes.push(start_node);
        queue.push_back((start, 0));

        while let Some((id, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            if let Some(limit) = max_nodes
                && nodes.len() >= limit
            {
                break;
            }
            let mut adjacent = self.adjacent_nodes(id, rel)?;
            // Deterministic tie-break for the frontier.
            adjacent.sort_by(|a, b| (a.ntype, a.nkey.as_str()).cmp(&(b.ntype, b.nkey.as_str())));
            for node in adjacent {
                if let Some(limit) = max_nodes
                    && nodes.len() >= limit
                {
                    break;
                }
                if visited.insert(node.id) {
                    queue.push_back((node.id, dist + 1));
                    nodes.push(node);
                }
            }
        }

        let edges = self.edges_between(&visited, rel)?;
        Ok((nodes, edges))
    }

    fn adjacent_nodes(&self, id: i64, rel: Option<RelKind>) -> Result<Vec<KgNode>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let sql = "SELECT n.id, n.ntype, n.nkey, n.title, n.data, n.created_at, n.updated_at
                   FROM edges e
                   JOIN nodes n ON n.id = CASE WHEN e.src = ?1 THEN e.dst ELSE e.src END
                   WHERE (e.src = ?1 OR e.dst = ?1)
                     AND (?2 IS NULL OR e.rel = ?2)";
        let mut stmt = conn.prepare(sql).context("failed to prepare adjacency")?;
        let rows = stmt
            .query_map(params![id, rel.map(|r| r.as_str())], row_to_node)
            .context("failed to query adjacency")?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.context("failed to read adjacent node")?);
        }
        Ok(nodes)
    }

    fn edges_between(&self, ids: &BTreeSet<i64>, rel: Option<RelKind>) -> Result<Vec<KgEdge>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT src, dst, rel, data, created_at FROM edges
                 WHERE (?1 IS NULL OR rel = ?1)
                 ORDER BY src, dst, rel",
            )
            .context("failed to prepare edge scan")?;
        let rows = stmt
            .query_map(params![rel.map(|r| r.as_str())], row_to_edge)
            .context("failed to query edges")?;
        let mut edges = Vec::new();
        for row in rows {
            let edge = row.context("failed to read edge")?;
            if ids.contains(&edge.src) && ids.contains(&edge.dst) {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    /// All nodes of one type, ordered by nkey.
    pub fn nodes_of_type(&self, ntype: NodeType) -> Result<Vec<KgNode>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, ntype, nkey, title, data, created_at, updated_at
                 FROM nodes WHERE ntype = ?1 ORDER BY nkey",
            )
            .context("failed to prepare node scan")?;
        let rows = stmt
            .query_map(params![ntype.as_str()], row_to_node)
            .context("failed to query nodes")?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.context("failed to read node")?);
        }
        Ok(nodes)
    }

    /// Recompute the owners index from `owns`/`authored` edges plus the
    /// declarative pattern file.
    ///
    /// Pattern owners are always present for their prefix; graph activity
    /// (who authored PRs touching files under the prefix) adds to their
    /// score and appends organic owners the patterns missed. Activity decays
    /// with a 30-day half-life.
    pub fn derive_owners(&self, patterns: &OwnershipPatterns, now: DateTime<Utc>) -> Result<OwnersIndex> {
        let mut entries: BTreeMap<String, Vec<OwnerEntry>> = BTreeMap::new();

        let mut prefixes: BTreeSet<String> =
            patterns.patterns.iter().map(|p| p.path.clone()).collect();
        // Directories that saw activity become prefixes too, so the index
        // covers paths the pattern file never mentions. Root-level files
        // stand as their own prefix.
        for file in self.nodes_of_type(NodeType::File)? {
            match file.nkey.rfind('/') {
                Some(idx) => prefixes.insert(file.nkey[..=idx].to_string()),
                None => prefixes.insert(file.nkey.clone()),
            };
        }

        for prefix in prefixes {
            let mut owners: BTreeMap<String, OwnerEntry> = BTreeMap::new();

            for pattern in patterns.patterns.iter().filter(|p| p.path == prefix) {
                for name in &pattern.owners {
                    let (kind, owner) = match name.strip_prefix("team:") {
                        Some(team) => (OwnerKind::Team, format!("team:{}", team)),
                        None => (OwnerKind::User, name.clone()),
                    };
                    owners.insert(
                        owner.clone(),
                        OwnerEntry {
                            owner,
                            kind,
                            // Declared ownership carries a floor score so a
                            // quiet team still outranks drive-by authors.
                            activity_score: 1.0,
                            last_activity: now,
                        },
                    );
                }
            }

            for (owner, kind, seen_at) in self.activity_under(&prefix)? {
                let age_days = (now - seen_at).num_seconds().max(0) as f64 / 86_400.0;
                let weight = 0.5_f64.powf(age_days / ACTIVITY_HALF_LIFE_DAYS);
                let entry = owners.entry(owner.clone()).or_insert(OwnerEntry {
                    owner,
                    kind,
                    activity_score: 0.0,
                    last_activity: seen_at,
                });
                entry.activity_score += weight;
                if seen_at > entry.last_activity {
                    entry.last_activity = seen_at;
                }
            }

            if owners.is_empty() {
                continue;
            }
            let mut ranked: Vec<OwnerEntry> = owners.into_values().collect();
            ranked.sort_by(|a, b| {
                b.activity_score
                    .partial_cmp(&a.activity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.owner.cmp(&b.owner))
            });
            entries.insert(prefix, ranked);
        }

        Ok(OwnersIndex {
            entries,
            generated_at: Some(now),
        })
    }

    /// `(owner, kind, activity timestamp)` tuples for PRs touching files
    /// under `prefix`, via `authored` and `owns` edges.
    fn activity_under(&self, prefix: &str) -> Result<Vec<(String, OwnerKind, DateTime<Utc>)>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT o.nkey, a.created_at
                 FROM nodes f
                 JOIN edges t  ON t.dst = f.id AND t.rel = 'touches'
                 JOIN nodes pr ON pr.id = t.src AND pr.ntype = 'PR'
                 JOIN edges a  ON a.dst = pr.id AND a.rel IN ('authored', 'owns')
                 JOIN nodes o  ON o.id = a.src AND o.ntype = 'Owner'
                 WHERE f.ntype = 'File' AND f.nkey LIKE ?1 || '%'",
            )
            .context("failed to prepare activity query")?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query activity")?;
        let mut activity = Vec::new();
        for row in rows {
            let (owner, created_at) = row.context("failed to read activity row")?;
            let seen_at: DateTime<Utc> = created_at
                .parse()
                .context("invalid edge timestamp in graph store")?;
            let kind = if owner.starts_with("team:") {
                OwnerKind::Team
            } else {
                OwnerKind::User
            };
            activity.push((owner, kind, seen_at));
        }
        Ok(activity)
    }

    /// Longest-pattern ownership lookup for a single path.
    pub fn ownership_lookup(
        &self,
        path: &str,
        patterns: &OwnershipPatterns,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, Vec<OwnerEntry>)>> {
        let index = self.derive_owners(patterns, now)?;
        Ok(index
            .lookup(path)
            .map(|(prefix, owners)| (prefix.to_string(), owners.to_vec())))
    }

    /// Delete `governed_by` edges pointing at Policy nodes whose rule no
    /// longer exists in the active bundle. Returns the number removed.
    pub fn vacuum_governed_by(&self, active_rules: &[String]) -> Result<u64> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let placeholder = std::iter::repeat_n("?", active_rules.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "DELETE FROM edges WHERE rel = 'governed_by' AND dst IN (
                 SELECT id FROM nodes WHERE ntype = 'Policy'{}
             )",
            if active_rules.is_empty() {
                String::new()
            } else {
                format!(" AND nkey NOT IN ({})", placeholder)
            }
        );
        let removed = conn
            .execute(&sql, rusqlite::params_from_iter(active_rules.iter()))
            .context("failed to vacuum governed_by edges")?;
        Ok(removed as u64)
    }

    // -- portal page catalog ------------------------------------------------

    /// Record a portal page emission.
    pub fn record_page(&self, page_key: &str, generated_at: DateTime<Utc>, sample_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.execute(
            "INSERT INTO portal_pages (page_key, generated_at, sample_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (page_key) DO UPDATE
                SET generated_at = excluded.generated_at,
                    sample_id = excluded.sample_id",
            params![page_key, generated_at.to_rfc3339(), sample_id],
        )
        .context("failed to record portal page")?;
        Ok(())
    }

    /// Page keys last generated before `cutoff`, for compaction.
    pub fn pages_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        let mut stmt = conn
            .prepare("SELECT page_key FROM portal_pages WHERE generated_at < ?1 ORDER BY page_key")
            .context("failed to prepare page scan")?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| row.get::<_, String>(0))
            .context("failed to query pages")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to read page key")?);
        }
        Ok(keys)
    }

    /// Drop a page from the catalog.
    pub fn forget_page(&self, page_key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("graph lock poisoned");
        conn.execute("DELETE FROM portal_pages WHERE page_key = ?1", params![page_key])
            .context("failed to forget portal page")?;
        Ok(())
    }
}

/// True when the error is a schema constraint violation, the fail-fast
/// dead-letter class.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(inner, _))
                if inner.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<KgNode> {
    let ntype: String = row.get(1)?;
    let data: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(KgNode {
        id: row.get(0)?,
        ntype: ntype.parse().unwrap_or(NodeType::File),
        nkey: row.get(2)?,
        title: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KgEdge> {
    let rel: String = row.get(2)?;
    let data: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(KgEdge {
        src: row.get(0)?,
        dst: row.get(1)?,
        rel: rel.parse().unwrap_or(RelKind::Touches),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> (tempfile::TempDir, GraphStore) {
        let td = tempfile::tempdir().expect("tempdir");
        let store = GraphStore::open(td.path().join("graph.db")).expect("open");
        (td, store)
    }

    #[test]
    fn upsert_node_returns_stable_id() {
        let (_td, store) = open_store();
        let a = store
            .upsert_node(NodeType::Pr, "acme/w#1", "first", json!({}))
            .expect("upsert");
        let b = store
            .upsert_node(NodeType::Pr, "acme/w#1", "updated", json!({"x": 1}))
            .expect("upsert");
        assert_eq!(a, b);

        let node = store.get_node(NodeType::Pr, "acme/w#1").expect("get").expect("present");
        assert_eq!(node.title, "updated");
        assert_eq!(node.data, json!({"x": 1}));
    }

    #[test]
    fn upsert_preserves_created_at() {
        let (_td, store) = open_store();
        store
            .upsert_node(NodeType::File, "a.rs", "a.rs", json!({}))
            .expect("upsert");
        let before = store.get_node(NodeType::File, "a.rs").expect("get").expect("present");
        std::thread::sleep(Duration::from_millis(10));
        store
            .upsert_node(NodeType::File, "a.rs", "a.rs", json!({}))
            .expect("upsert");
        let after = store.get_node(NodeType::File, "a.rs").expect("get").expect("present");
        assert_eq!(before.created_at, after.created_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn same_nkey_different_ntype_are_distinct() {
        let (_td, store) = open_store();
        let a = store
            .upsert_node(NodeType::File, "auth", "auth file", json!({}))
            .expect("upsert");
        let b = store
            .upsert_node(NodeType::Owner, "auth", "auth team", json!({}))
            .expect("upsert");
        assert_ne!(a, b);
    }

    #[test]
    fn upsert_edge_deduplicates_on_triple() {
        let (_td, store) = open_store();
        let pr = store.upsert_node(NodeType::Pr, "p#1", "pr", json!({})).expect("n");
        let file = store.upsert_node(NodeType::File, "f.rs", "f", json!({})).expect("n");
        store.upsert_edge(pr, file, RelKind::Touches, json!({})).expect("e");
        store
            .upsert_edge(pr, file, RelKind::Touches, json!({"lines": 3}))
            .expect("e");
        store.upsert_edge(pr, file, RelKind::TestedBy, json!({})).expect("e");

        let (_, edges) = store.neighbors(pr, None, 1, None).expect("bfs");
        assert_eq!(edges.len(), 2);
        let touch = edges.iter().find(|e| e.rel == RelKind::Touches).expect("touch edge");
        assert_eq!(touch.data, json!({"lines": 3}));
    }

    #[test]
    fn edge_to_missing_node_is_constraint_violation() {
        let (_td, store) = open_store();
        let pr = store.upsert_node(NodeType::Pr, "p#1", "pr", json!({})).expect("n");
        let err = store
            .upsert_edge(pr, 9999, RelKind::Touches, json!({}))
            .expect_err("dangling edge must fail");
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn delete_cascade_removes_incident_edges() {
        let (_td, store) = open_store();
        let pr = store.upsert_node(NodeType::Pr, "p#1", "pr", json!({})).expect("n");
        let file = store.upsert_node(NodeType::File, "f.rs", "f", json!({})).expect("n");
        store.upsert_edge(pr, file, RelKind::Touches, json!({})).expect("e");

        assert!(store.delete_cascade(NodeType::File, "f.rs").expect("delete"));
        let (nodes, edges) = store.neighbors(pr, None, 2, None).expect("bfs");
        assert_eq!(nodes.len(), 1);
        assert!(edges.is_empty());
    }

    #[test]
    fn neighbors_respects_depth() {
        let (_td, store) = open_store();
        let a = store.upsert_node(NodeType::Pr, "a", "a", json!({})).expect("n");
        let b = store.upsert_node(NodeType::File, "b", "b", json!({})).expect("n");
        let c = store.upsert_node(NodeType::Symbol, "c", "c", json!({})).expect("n");
        store.upsert_edge(a, b, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(b, c, RelKind::Defines, json!({})).expect("e");

        let (nodes, _) = store.neighbors(a, None, 1, None).expect("bfs");
        assert_eq!(nodes.len(), 2);
        let (nodes, _) = store.neighbors(a, None, 2, None).expect("bfs");
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn neighbors_handles_cycles() {
        let (_td, store) = open_store();
        let a = store.upsert_node(NodeType::Pr, "a", "a", json!({})).expect("n");
        let b = store.upsert_node(NodeType::File, "b", "b", json!({})).expect("n");
        store.upsert_edge(a, b, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(b, a, RelKind::Caused, json!({})).expect("e");

        let (nodes, edges) = store.neighbors(a, None, 5, None).expect("bfs");
        assert_eq!(nodes.len(), 2);
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn neighbors_filters_by_rel() {
        let (_td, store) = open_store();
        let a = store.upsert_node(NodeType::Pr, "a", "a", json!({})).expect("n");
        let b = store.upsert_node(NodeType::File, "b", "b", json!({})).expect("n");
        let c = store.upsert_node(NodeType::Owner, "c", "c", json!({})).expect("n");
        store.upsert_edge(a, b, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(c, a, RelKind::Authored, json!({})).expect("e");

        let (nodes, edges) = store.neighbors(a, Some(RelKind::Touches), 2, None).expect("bfs");
        assert_eq!(nodes.len(), 2);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].rel, RelKind::Touches);
    }

    #[test]
    fn neighbors_max_nodes_cuts_deterministically() {
        let (_td, store) = open_store();
        let pr = store.upsert_node(NodeType::Pr, "p#1", "pr", json!({})).expect("n");
        for name in ["zeta.rs", "alpha.rs", "mid.rs"] {
            let f = store.upsert_node(NodeType::File, name, name, json!({})).expect("n");
            store.upsert_edge(pr, f, RelKind::Touches, json!({})).expect("e");
        }

        let (nodes, _) = store.neighbors(pr, None, 1, Some(3)).expect("bfs");
        let keys: Vec<_> = nodes.iter().map(|n| n.nkey.as_str()).collect();
        // Start node first, then (ntype, nkey) ascending.
        assert_eq!(keys, vec!["p#1", "alpha.rs", "mid.rs"]);
    }

    #[test]
    fn concurrent_upserts_converge_on_one_row() {
        use std::sync::Arc;

        let td = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(GraphStore::open(td.path().join("graph.db")).expect("open"));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .upsert_node(NodeType::Pr, "contested", &format!("t{}", i), json!({}))
                    .expect("upsert")
            }));
        }
        let ids: BTreeSet<i64> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.nodes_of_type(NodeType::Pr).expect("scan").len(), 1);
    }

    #[test]
    fn derive_owners_combines_patterns_and_activity() {
        let (_td, store) = open_store();
        let now = Utc::now();

        let pr = store.upsert_node(NodeType::Pr, "acme/w#1", "pr", json!({})).expect("n");
        let file = store
            .upsert_node(NodeType::File, "src/auth/token.rs", "token.rs", json!({}))
            .expect("n");
        let alice = store.upsert_node(NodeType::Owner, "alice", "alice", json!({})).expect("n");
        store.upsert_edge(pr, file, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(alice, pr, RelKind::Authored, json!({})).expect("e");

        let patterns = OwnershipPatterns {
            patterns: vec![OwnershipPattern {
                path: "src/auth/".to_string(),
                owners: vec!["team:security".to_string()],
            }],
        };

        let index = store.derive_owners(&patterns, now).expect("derive");
        let (prefix, owners) = index.lookup("src/auth/token.rs").expect("match");
        assert_eq!(prefix, "src/auth/");
        let names: Vec<_> = owners.iter().map(|o| o.owner.as_str()).collect();
        assert!(names.contains(&"team:security"));
        assert!(names.contains(&"alice"));
        let team = owners.iter().find(|o| o.owner == "team:security").expect("team");
        assert_eq!(team.kind, OwnerKind::Team);
    }

    #[test]
    fn heavier_activity_ranks_first() {
        let (_td, store) = open_store();
        let now = Utc::now();

        let file = store
            .upsert_node(NodeType::File, "src/lib.rs", "lib.rs", json!({}))
            .expect("n");
        let old_pr = store.upsert_node(NodeType::Pr, "w#1", "old", json!({})).expect("n");
        let new_pr = store.upsert_node(NodeType::Pr, "w#2", "new", json!({})).expect("n");
        let bob = store.upsert_node(NodeType::Owner, "bob", "bob", json!({})).expect("n");
        let eve = store.upsert_node(NodeType::Owner, "eve", "eve", json!({})).expect("n");
        store.upsert_edge(old_pr, file, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(new_pr, file, RelKind::Touches, json!({})).expect("e");
        store.upsert_edge(bob, old_pr, RelKind::Authored, json!({})).expect("e");
        store.upsert_edge(eve, new_pr, RelKind::Authored, json!({})).expect("e");
        // Both eve and bob authored one PR each; eve twice on the new one.
        store.upsert_edge(eve, new_pr, RelKind::Owns, json!({})).expect("e");

        let index = store.derive_owners(&OwnershipPatterns::default(), now).expect("derive");
        let (_, owners) = index.lookup("src/lib.rs").expect("match");
        assert_eq!(owners[0].owner, "eve");
    }

    #[test]
    fn vacuum_governed_by_drops_removed_rules() {
        let (_td, store) = open_store();
        let pr = store.upsert_node(NodeType::Pr, "w#1", "pr", json!({})).expect("n");
        let live = store
            .upsert_node(NodeType::Policy, "block_high_risk", "block", json!({}))
            .expect("n");
        let dead = store
            .upsert_node(NodeType::Policy, "retired_rule", "old", json!({}))
            .expect("n");
        store.upsert_edge(pr, live, RelKind::GovernedBy, json!({})).expect("e");
        store.upsert_edge(pr, dead, RelKind::GovernedBy, json!({})).expect("e");

        let removed = store
            .vacuum_governed_by(&["block_high_risk".to_string()])
            .expect("vacuum");
        assert_eq!(removed, 1);
        let (_, edges) = store.neighbors(pr, Some(RelKind::GovernedBy), 1, None).expect("bfs");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dst, live);
    }

    #[test]
    fn portal_page_catalog_round_trip() {
        let (_td, store) = open_store();
        let now = Utc::now();
        store.record_page("prs/1.md", now, "s-1").expect("record");
        store.record_page("prs/1.md", now, "s-2").expect("re-record");

        let old = now - chrono::Duration::days(30);
        store.record_page("prs/2.md", old, "s-3").expect("record");

        let stale = store
            .pages_older_than(now - chrono::Duration::days(7))
            .expect("scan");
        assert_eq!(stale, vec!["prs/2.md"]);

        store.forget_page("prs/2.md").expect("forget");
        let stale = store
            .pages_older_than(now - chrono::Duration::days(7))
            .expect("scan");
        assert!(stale.is_empty());
    }

    #[test]
    fn ping_succeeds_on_open_store() {
        let (_td, store) = open_store();
        store.ping().expect("ping");
    }
}
