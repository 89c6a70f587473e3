//! Embedded relational store for the orchestrator.
//!
//! Every durable row — download queue, inference queue, service status
//! blobs, retrieval chunks — lives in one SQLite database inside the managed
//! home directory. Accessors are synchronous and atomic per row; the
//! `*_async` wrappers run the same calls on the blocking thread pool so the
//! async workers never stall the runtime on disk I/O.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

mod types;
pub use types::*;

const DB_FILE: &str = "wingman.sqlite";

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    pool: Arc<Pool>,
}

struct Pool {
    state: Mutex<PoolState>,
    cvar: Condvar,
    max: usize,
}

struct PoolState {
    conns: Vec<Connection>,
    created: usize,
}

struct ManagedConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl Deref for ManagedConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl DerefMut for ManagedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
            guard.conns.push(conn);
            drop(guard);
            self.pool.cvar.notify_one();
        }
    }
}

impl Kernel {
    /// Opens (creating if needed) the store inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let pool_max = std::env::var("WINGMAN_SQLITE_POOL_MAX")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(4);
        let conn = Connection::open(&db_path)?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;
        let pool = Arc::new(Pool {
            state: Mutex::new(PoolState {
                conns: vec![conn],
                created: 1,
            }),
            cvar: Condvar::new(),
            max: pool_max,
        });
        Ok(Self { db_path, pool })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
              model_repo TEXT NOT NULL,
              file_path TEXT NOT NULL,
              status TEXT NOT NULL,
              total_bytes INTEGER NOT NULL DEFAULT 0,
              downloaded_bytes INTEGER NOT NULL DEFAULT 0,
              progress REAL NOT NULL DEFAULT 0,
              error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              PRIMARY KEY (model_repo, file_path)
            );
            CREATE INDEX IF NOT EXISTS idx_downloads_status_created ON downloads(status, created);
            CREATE INDEX IF NOT EXISTS idx_downloads_updated ON downloads(updated);

            CREATE TABLE IF NOT EXISTS wingman (
              alias TEXT PRIMARY KEY,
              model_repo TEXT NOT NULL,
              file_path TEXT NOT NULL,
              status TEXT NOT NULL,
              address TEXT NOT NULL,
              port INTEGER NOT NULL,
              context_size INTEGER NOT NULL DEFAULT 0,
              gpu_layers INTEGER NOT NULL DEFAULT -1,
              error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wingman_status_created ON wingman(status, created);
            CREATE INDEX IF NOT EXISTS idx_wingman_port ON wingman(port);

            CREATE TABLE IF NOT EXISTS app (
              name TEXT NOT NULL,
              key TEXT NOT NULL DEFAULT 'default',
              value TEXT NOT NULL,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              PRIMARY KEY (name, key)
            );

            CREATE TABLE IF NOT EXISTS retrieval_chunks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source TEXT NOT NULL,
              chunk TEXT NOT NULL,
              embedding BLOB NOT NULL,
              created TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<ManagedConnection> {
        let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
        loop {
            if let Some(conn) = guard.conns.pop() {
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            if guard.created < self.pool.max {
                guard.created += 1;
                drop(guard);
                let conn = Connection::open(&self.db_path)?;
                Self::apply_pragmas(&conn)?;
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            guard = self.pool.cvar.wait(guard).expect("pool mutex poisoned");
        }
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Kernel) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let kernel = self.clone();
        tokio::task::spawn_blocking(move || f(kernel))
            .await
            .map_err(|e| anyhow!("kernel blocking task failed: {e}"))?
    }

    // ---------- downloads ----------

    fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadItem> {
        let status_s: String = row.get(2)?;
        Ok(DownloadItem {
            model_repo: row.get(0)?,
            file_path: row.get(1)?,
            status: DownloadItemStatus::parse(&status_s).unwrap_or(DownloadItemStatus::Error),
            total_bytes: row.get(3)?,
            downloaded_bytes: row.get(4)?,
            progress: row.get(5)?,
            error: row.get(6)?,
            created: row.get(7)?,
            updated: row.get(8)?,
        })
    }

    const DOWNLOAD_COLS: &'static str =
        "model_repo,file_path,status,total_bytes,downloaded_bytes,progress,error,created,updated";

    pub fn get_download(&self, model_repo: &str, file_path: &str) -> Result<Option<DownloadItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM downloads WHERE model_repo=? AND file_path=? LIMIT 1",
            Self::DOWNLOAD_COLS
        ))?;
        let item = stmt
            .query_row(params![model_repo, file_path], Self::row_to_download)
            .optional()?;
        Ok(item)
    }

    /// Inserts a fresh `queued` row and returns it. Fails if a row with the
    /// same key already exists.
    pub fn enqueue_download(&self, model_repo: &str, file_path: &str) -> Result<DownloadItem> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO downloads(model_repo,file_path,status,total_bytes,downloaded_bytes,progress,created,updated)
             VALUES(?,?,?,0,0,0,?,?)",
            params![model_repo, file_path, DownloadItemStatus::Queued.as_str(), now, now],
        )?;
        Ok(DownloadItem {
            model_repo: model_repo.to_string(),
            file_path: file_path.to_string(),
            status: DownloadItemStatus::Queued,
            total_bytes: 0,
            downloaded_bytes: 0,
            progress: 0.0,
            error: None,
            created: now.clone(),
            updated: now,
        })
    }

    /// Upsert preserving `created` on conflict.
    pub fn set_download(&self, item: &DownloadItem) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO downloads(model_repo,file_path,status,total_bytes,downloaded_bytes,progress,error,created,updated)
             VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(model_repo,file_path) DO UPDATE SET
               status=excluded.status,
               total_bytes=excluded.total_bytes,
               downloaded_bytes=excluded.downloaded_bytes,
               progress=excluded.progress,
               error=excluded.error,
               updated=excluded.updated",
            params![
                item.model_repo,
                item.file_path,
                item.status.as_str(),
                item.total_bytes,
                item.downloaded_bytes,
                item.progress,
                item.error,
                item.created,
                now
            ],
        )?;
        Ok(())
    }

    pub fn remove_download(&self, model_repo: &str, file_path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM downloads WHERE model_repo=? AND file_path=?",
            params![model_repo, file_path],
        )?;
        Ok(n > 0)
    }

    pub fn get_all_downloads(&self) -> Result<Vec<DownloadItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM downloads ORDER BY created, rowid",
            Self::DOWNLOAD_COLS
        ))?;
        let rows = stmt.query_map([], Self::row_to_download)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_downloads_by_status(&self, status: DownloadItemStatus) -> Result<Vec<DownloadItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM downloads WHERE status=? ORDER BY created, rowid",
            Self::DOWNLOAD_COLS
        ))?;
        let rows = stmt.query_map([status.as_str()], Self::row_to_download)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rows updated within the trailing window. RFC3339 UTC strings order
    /// lexicographically, so a plain text compare is enough.
    pub fn get_downloads_since(&self, window: chrono::Duration) -> Result<Vec<DownloadItem>> {
        let cutoff = (chrono::Utc::now() - window)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM downloads WHERE updated >= ? ORDER BY created, rowid",
            Self::DOWNLOAD_COLS
        ))?;
        let rows = stmt.query_map([cutoff], Self::row_to_download)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claims the oldest `queued` row, flipping it to `downloading` in the
    /// same statement so a racing worker cannot take it too.
    pub fn claim_next_queued_download(&self) -> Result<Option<DownloadItem>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let mut stmt = conn.prepare_cached(&format!(
            "UPDATE downloads SET status='downloading', updated=?1 WHERE rowid = (
                 SELECT rowid FROM downloads WHERE status='queued' ORDER BY created, rowid LIMIT 1
             ) RETURNING {}",
            Self::DOWNLOAD_COLS
        ))?;
        let mut rows = stmt.query(params![now])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::row_to_download(row)?));
        }
        Ok(None)
    }

    /// Returns in-flight transfers to the queue; run at reconciliation.
    pub fn reset_downloads(&self) -> Result<u64> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE downloads SET status='queued', updated=? WHERE status='downloading'",
            params![now],
        )?;
        Ok(n as u64)
    }

    // ---------- wingman items ----------

    fn row_to_wingman(row: &rusqlite::Row<'_>) -> rusqlite::Result<WingmanItem> {
        let status_s: String = row.get(3)?;
        Ok(WingmanItem {
            alias: row.get(0)?,
            model_repo: row.get(1)?,
            file_path: row.get(2)?,
            status: WingmanItemStatus::parse(&status_s).unwrap_or(WingmanItemStatus::Unknown),
            address: row.get(4)?,
            port: row.get(5)?,
            context_size: row.get(6)?,
            gpu_layers: row.get(7)?,
            error: row.get(8)?,
            created: row.get(9)?,
            updated: row.get(10)?,
        })
    }

    const WINGMAN_COLS: &'static str =
        "alias,model_repo,file_path,status,address,port,context_size,gpu_layers,error,created,updated";

    pub fn get_wingman(&self, alias: &str) -> Result<Option<WingmanItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM wingman WHERE alias=? LIMIT 1",
            Self::WINGMAN_COLS
        ))?;
        let item = stmt
            .query_row(params![alias], Self::row_to_wingman)
            .optional()?;
        Ok(item)
    }

    pub fn set_wingman(&self, item: &WingmanItem) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO wingman(alias,model_repo,file_path,status,address,port,context_size,gpu_layers,error,created,updated)
             VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
             ON CONFLICT(alias) DO UPDATE SET
               model_repo=excluded.model_repo,
               file_path=excluded.file_path,
               status=excluded.status,
               address=excluded.address,
               port=excluded.port,
               context_size=excluded.context_size,
               gpu_layers=excluded.gpu_layers,
               error=excluded.error,
               updated=excluded.updated",
            params![
                item.alias,
                item.model_repo,
                item.file_path,
                item.status.as_str(),
                item.address,
                item.port,
                item.context_size,
                item.gpu_layers,
                item.error,
                item.created,
                now
            ],
        )?;
        Ok(())
    }

    pub fn remove_wingman(&self, alias: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM wingman WHERE alias=?", params![alias])?;
        Ok(n > 0)
    }

    pub fn get_all_wingman(&self) -> Result<Vec<WingmanItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM wingman ORDER BY created, rowid",
            Self::WINGMAN_COLS
        ))?;
        let rows = stmt.query_map([], Self::row_to_wingman)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_wingman_by_status(&self, status: WingmanItemStatus) -> Result<Vec<WingmanItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM wingman WHERE status=? ORDER BY created, rowid",
            Self::WINGMAN_COLS
        ))?;
        let rows = stmt.query_map([status.as_str()], Self::row_to_wingman)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_active_wingman(&self) -> Result<Vec<WingmanItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM wingman WHERE status IN ('queued','preparing','inferring','cancelling')
             ORDER BY created, rowid",
            Self::WINGMAN_COLS
        ))?;
        let rows = stmt.query_map([], Self::row_to_wingman)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_wingman_by_port(&self, port: i64) -> Result<Vec<WingmanItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM wingman WHERE port=? ORDER BY created, rowid",
            Self::WINGMAN_COLS
        ))?;
        let rows = stmt.query_map(params![port], Self::row_to_wingman)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claims the oldest `queued` row, flipping it to `preparing` atomically.
    pub fn claim_next_queued_wingman(&self) -> Result<Option<WingmanItem>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let mut stmt = conn.prepare_cached(&format!(
            "UPDATE wingman SET status='preparing', updated=?1 WHERE alias = (
                 SELECT alias FROM wingman WHERE status='queued' ORDER BY created, rowid LIMIT 1
             ) RETURNING {}",
            Self::WINGMAN_COLS
        ))?;
        let mut rows = stmt.query(params![now])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(Self::row_to_wingman(row)?));
        }
        Ok(None)
    }

    pub fn update_wingman_status(
        &self,
        alias: &str,
        status: WingmanItemStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let n = conn.execute(
            "UPDATE wingman SET status=?, error=COALESCE(?,error), updated=? WHERE alias=?",
            params![status.as_str(), error, now, alias],
        )?;
        Ok(n > 0)
    }

    pub fn count_active_wingman(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(1) FROM wingman WHERE status IN ('queued','preparing','inferring','cancelling')",
        )?;
        let n: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(n)
    }

    // ---------- app items ----------

    pub fn get_app(&self, name: &str, key: &str) -> Result<Option<AppItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT name,key,value,created,updated FROM app WHERE name=? AND key=? LIMIT 1",
        )?;
        let item = stmt
            .query_row(params![name, key], |row| {
                Ok(AppItem {
                    name: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                    created: row.get(3)?,
                    updated: row.get(4)?,
                })
            })
            .optional()?;
        Ok(item)
    }

    pub fn set_app(&self, item: &AppItem) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO app(name,key,value,created,updated) VALUES(?1,?2,?3,?4,?5)
             ON CONFLICT(name,key) DO UPDATE SET value=excluded.value, updated=excluded.updated",
            params![item.name, item.key, item.value, item.created, now],
        )?;
        Ok(())
    }

    pub fn get_all_app(&self) -> Result<Vec<AppItem>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT name,key,value,created,updated FROM app ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(AppItem {
                name: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
                created: row.get(3)?,
                updated: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------- retrieval chunks ----------

    pub fn insert_chunk(&self, source: &str, chunk: &str, embedding: &[f32]) -> Result<i64> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for v in embedding {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        conn.execute(
            "INSERT INTO retrieval_chunks(source,chunk,embedding,created) VALUES(?,?,?,?)",
            params![source, chunk, blob, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Linear scan over every stored chunk, ranked by angular distance
    /// (ascending). Adequate at local scale; see the design ledger.
    pub fn nearest_chunks(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(RetrievalChunk, f32)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT id,source,chunk,embedding,created FROM retrieval_chunks")?;
        let mut rows = stmt.query([])?;
        let mut scored: Vec<(RetrievalChunk, f32)> = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(3)?;
            let stored = decode_embedding(&blob);
            if stored.len() != embedding.len() {
                continue;
            }
            let distance = angular_distance(embedding, &stored);
            scored.push((
                RetrievalChunk {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    chunk: row.get(2)?,
                    created: row.get(4)?,
                },
                distance,
            ));
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    // ---------- async wrappers ----------

    pub async fn get_download_async(
        &self,
        model_repo: &str,
        file_path: &str,
    ) -> Result<Option<DownloadItem>> {
        let (r, f) = (model_repo.to_string(), file_path.to_string());
        self.run_blocking(move |k| k.get_download(&r, &f)).await
    }

    pub async fn enqueue_download_async(
        &self,
        model_repo: &str,
        file_path: &str,
    ) -> Result<DownloadItem> {
        let (r, f) = (model_repo.to_string(), file_path.to_string());
        self.run_blocking(move |k| k.enqueue_download(&r, &f)).await
    }

    pub async fn set_download_async(&self, item: &DownloadItem) -> Result<()> {
        let item = item.clone();
        self.run_blocking(move |k| k.set_download(&item)).await
    }

    pub async fn remove_download_async(&self, model_repo: &str, file_path: &str) -> Result<bool> {
        let (r, f) = (model_repo.to_string(), file_path.to_string());
        self.run_blocking(move |k| k.remove_download(&r, &f)).await
    }

    pub async fn get_all_downloads_async(&self) -> Result<Vec<DownloadItem>> {
        self.run_blocking(|k| k.get_all_downloads()).await
    }

    pub async fn get_downloads_since_async(
        &self,
        window: chrono::Duration,
    ) -> Result<Vec<DownloadItem>> {
        self.run_blocking(move |k| k.get_downloads_since(window))
            .await
    }

    pub async fn claim_next_queued_download_async(&self) -> Result<Option<DownloadItem>> {
        self.run_blocking(|k| k.claim_next_queued_download()).await
    }

    pub async fn reset_downloads_async(&self) -> Result<u64> {
        self.run_blocking(|k| k.reset_downloads()).await
    }

    pub async fn get_wingman_async(&self, alias: &str) -> Result<Option<WingmanItem>> {
        let alias = alias.to_string();
        self.run_blocking(move |k| k.get_wingman(&alias)).await
    }

    pub async fn set_wingman_async(&self, item: &WingmanItem) -> Result<()> {
        let item = item.clone();
        self.run_blocking(move |k| k.set_wingman(&item)).await
    }

    pub async fn remove_wingman_async(&self, alias: &str) -> Result<bool> {
        let alias = alias.to_string();
        self.run_blocking(move |k| k.remove_wingman(&alias)).await
    }

    pub async fn get_all_wingman_async(&self) -> Result<Vec<WingmanItem>> {
        self.run_blocking(|k| k.get_all_wingman()).await
    }

    pub async fn get_wingman_by_status_async(
        &self,
        status: WingmanItemStatus,
    ) -> Result<Vec<WingmanItem>> {
        self.run_blocking(move |k| k.get_wingman_by_status(status))
            .await
    }

    pub async fn get_active_wingman_async(&self) -> Result<Vec<WingmanItem>> {
        self.run_blocking(|k| k.get_active_wingman()).await
    }

    pub async fn claim_next_queued_wingman_async(&self) -> Result<Option<WingmanItem>> {
        self.run_blocking(|k| k.claim_next_queued_wingman()).await
    }

    pub async fn get_wingman_by_port_async(&self, port: i64) -> Result<Vec<WingmanItem>> {
        self.run_blocking(move |k| k.get_wingman_by_port(port)).await
    }

    pub async fn update_wingman_status_async(
        &self,
        alias: &str,
        status: WingmanItemStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let alias = alias.to_string();
        self.run_blocking(move |k| k.update_wingman_status(&alias, status, error.as_deref()))
            .await
    }

    pub async fn count_active_wingman_async(&self) -> Result<i64> {
        self.run_blocking(|k| k.count_active_wingman()).await
    }

    pub async fn get_app_async(&self, name: &str, key: &str) -> Result<Option<AppItem>> {
        let (n, k2) = (name.to_string(), key.to_string());
        self.run_blocking(move |k| k.get_app(&n, &k2)).await
    }

    pub async fn set_app_async(&self, item: &AppItem) -> Result<()> {
        let item = item.clone();
        self.run_blocking(move |k| k.set_app(&item)).await
    }

    pub async fn insert_chunk_async(
        &self,
        source: &str,
        chunk: &str,
        embedding: Vec<f32>,
    ) -> Result<i64> {
        let (s, c) = (source.to_string(), chunk.to_string());
        self.run_blocking(move |k| k.insert_chunk(&s, &c, &embedding))
            .await
    }

    pub async fn nearest_chunks_async(
        &self,
        embedding: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<(RetrievalChunk, f32)>> {
        self.run_blocking(move |k| k.nearest_chunks(&embedding, limit))
            .await
    }
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Annoy-style angular distance: sqrt(2 * (1 - cos)).
fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    let cos = cosine_sim(a, b).clamp(-1.0, 1.0);
    (2.0 * (1.0 - cos)).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        (dir, kernel)
    }

    fn wingman_item(alias: &str, port: i64) -> WingmanItem {
        let now = now_rfc3339();
        WingmanItem {
            alias: alias.to_string(),
            model_repo: "TheBloke/Xwin-LM-13B-V0.1-GGUF".into(),
            file_path: "xwin-lm-13b-v0.1.Q2_K.gguf".into(),
            status: WingmanItemStatus::Queued,
            address: "localhost".into(),
            port,
            context_size: 0,
            gpu_layers: -1,
            error: None,
            created: now.clone(),
            updated: now,
        }
    }

    #[test]
    fn enqueue_then_get_round_trips() {
        let (_dir, kernel) = open_temp();
        let item = kernel.enqueue_download("X", "y.bin").expect("enqueue");
        assert_eq!(item.status, DownloadItemStatus::Queued);
        assert_eq!(item.progress, 0.0);
        let got = kernel.get_download("X", "y.bin").unwrap().expect("row");
        assert_eq!(got.model_repo, "X");
        assert_eq!(got.status, DownloadItemStatus::Queued);
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let (_dir, kernel) = open_temp();
        kernel.enqueue_download("X", "y.bin").unwrap();
        assert!(kernel.enqueue_download("X", "y.bin").is_err());
    }

    #[test]
    fn downloads_claim_in_fifo_order() {
        let (_dir, kernel) = open_temp();
        for name in ["a.bin", "b.bin", "c.bin"] {
            kernel.enqueue_download("repo", name).unwrap();
        }
        let first = kernel.claim_next_queued_download().unwrap().unwrap();
        assert_eq!(first.file_path, "a.bin");
        assert_eq!(first.status, DownloadItemStatus::Downloading);
        let second = kernel.claim_next_queued_download().unwrap().unwrap();
        assert_eq!(second.file_path, "b.bin");
        let third = kernel.claim_next_queued_download().unwrap().unwrap();
        assert_eq!(third.file_path, "c.bin");
        assert!(kernel.claim_next_queued_download().unwrap().is_none());
    }

    #[test]
    fn reset_returns_inflight_downloads_to_queue() {
        let (_dir, kernel) = open_temp();
        kernel.enqueue_download("repo", "a.bin").unwrap();
        kernel.claim_next_queued_download().unwrap().unwrap();
        assert_eq!(kernel.reset_downloads().unwrap(), 1);
        let row = kernel.get_download("repo", "a.bin").unwrap().unwrap();
        assert_eq!(row.status, DownloadItemStatus::Queued);
        // claimable again after reset
        assert!(kernel.claim_next_queued_download().unwrap().is_some());
    }

    #[test]
    fn wingman_claim_flips_to_preparing() {
        let (_dir, kernel) = open_temp();
        kernel.set_wingman(&wingman_item("a1", 6567)).unwrap();
        let claimed = kernel.claim_next_queued_wingman().unwrap().unwrap();
        assert_eq!(claimed.alias, "a1");
        assert_eq!(claimed.status, WingmanItemStatus::Preparing);
        assert!(kernel.claim_next_queued_wingman().unwrap().is_none());
    }

    #[test]
    fn active_count_tracks_status_transitions() {
        let (_dir, kernel) = open_temp();
        kernel.set_wingman(&wingman_item("a1", 6567)).unwrap();
        assert_eq!(kernel.count_active_wingman().unwrap(), 1);
        kernel
            .update_wingman_status("a1", WingmanItemStatus::Inferring, None)
            .unwrap();
        assert_eq!(kernel.count_active_wingman().unwrap(), 1);
        kernel
            .update_wingman_status("a1", WingmanItemStatus::Complete, None)
            .unwrap();
        assert_eq!(kernel.count_active_wingman().unwrap(), 0);
        let active = kernel.get_active_wingman().unwrap();
        assert!(active.is_empty());
    }

    #[test]
    fn update_status_preserves_existing_error() {
        let (_dir, kernel) = open_temp();
        kernel.set_wingman(&wingman_item("a1", 6567)).unwrap();
        kernel
            .update_wingman_status("a1", WingmanItemStatus::Error, Some("Out of memory."))
            .unwrap();
        kernel
            .update_wingman_status("a1", WingmanItemStatus::Error, None)
            .unwrap();
        let row = kernel.get_wingman("a1").unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("Out of memory."));
    }

    #[test]
    fn app_item_upsert_and_projection() {
        let (_dir, kernel) = open_temp();
        let mut item = AppItem::make("WingmanService");
        let blob = WingmanServiceAppItem {
            status: ServiceStatus::Inferring,
            alias: Some("a1".into()),
            error: None,
        };
        item.value = serde_json::to_string(&blob).unwrap();
        kernel.set_app(&item).unwrap();
        let stored = kernel.get_app("WingmanService", "default").unwrap().unwrap();
        let parsed: WingmanServiceAppItem = serde_json::from_str(&stored.value).unwrap();
        assert_eq!(parsed.status, ServiceStatus::Inferring);
        assert_eq!(parsed.alias.as_deref(), Some("a1"));
    }

    #[test]
    fn nearest_chunks_orders_by_angular_distance() {
        let (_dir, kernel) = open_temp();
        kernel.insert_chunk("doc", "exact", &[1.0, 0.0]).unwrap();
        kernel.insert_chunk("doc", "near", &[0.9, 0.1]).unwrap();
        kernel.insert_chunk("doc", "far", &[-1.0, 0.0]).unwrap();
        kernel.insert_chunk("doc", "odd-dims", &[1.0, 0.0, 0.0]).unwrap();
        let hits = kernel.nearest_chunks(&[1.0, 0.0], 10).unwrap();
        let order: Vec<&str> = hits.iter().map(|(c, _)| c.chunk.as_str()).collect();
        assert_eq!(order, vec!["exact", "near", "far"]);
        assert!(hits[0].1 < 1e-3);
        assert!(hits[2].1 > 1.9);
    }

    #[tokio::test]
    async fn async_wrappers_share_the_store() {
        let (_dir, kernel) = open_temp();
        kernel.enqueue_download_async("X", "y.bin").await.unwrap();
        let rows = kernel.get_all_downloads_async().await.unwrap();
        assert_eq!(rows.len(), 1);
        let claimed = kernel.claim_next_queued_download_async().await.unwrap();
        assert_eq!(claimed.unwrap().file_path, "y.bin");
    }
}
