//! Embedded SQLite implementation of [`WalletDatabase`].
use std::{path::Path, str::FromStr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Txid};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::{
    elements::Txo,
    matcher::TransactionMatch,
    store::WalletDatabase,
    types::{ElementIndex, Position, SubchainId},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS last_scanned (
        subchain TEXT PRIMARY KEY,
        height   INTEGER NOT NULL,
        hash     TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS patterns (
        subchain TEXT NOT NULL,
        idx      INTEGER NOT NULL,
        data     BLOB NOT NULL,
        PRIMARY KEY (subchain, idx, data)
    );

    CREATE TABLE IF NOT EXISTS outputs (
        subchain     TEXT NOT NULL,
        txid         TEXT NOT NULL,
        vout         INTEGER NOT NULL,
        idx          INTEGER NOT NULL,
        height       INTEGER NOT NULL,
        value        INTEGER NOT NULL,
        spent_height INTEGER,
        PRIMARY KEY (subchain, txid, vout)
    );
"#;

/// Tables:
///   last_scanned(subchain, height, hash)
///   patterns(subchain, idx, data)
///   outputs(subchain, txid, vout, idx, height, value, spent_height)
///
/// `subchain` is [`SubchainId::db_key`]. One connection is shared behind a
/// mutex and every query runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteWalletDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWalletDb {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        Self::with_connection(conn)
    }

    /// Convenient in-memory database (useful for tests).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("create wallet schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn parse_txid(s: &str) -> anyhow::Result<Txid> {
    Txid::from_str(s).with_context(|| format!("parse txid {s}"))
}

#[async_trait]
impl WalletDatabase for SqliteWalletDb {
    async fn subchain_last_scanned(&self, subchain: &SubchainId) -> anyhow::Result<Option<Position>> {
        let key = subchain.db_key();
        self.run(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT height, hash FROM last_scanned WHERE subchain = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((height, hash)) => {
                    let height = u32::try_from(height).context("parse last_scanned height")?;
                    let hash = BlockHash::from_str(&hash).context("parse last_scanned hash")?;
                    Ok(Some(Position::new(height, hash)))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_subchain_last_scanned(
        &self,
        subchain: &SubchainId,
        position: Position,
    ) -> anyhow::Result<()> {
        let key = subchain.db_key();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO last_scanned(subchain, height, hash) VALUES(?1, ?2, ?3)
                 ON CONFLICT(subchain) DO UPDATE SET height=excluded.height, hash=excluded.hash",
                params![key, i64::from(position.height), position.hash.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_patterns(
        &self,
        subchain: &SubchainId,
    ) -> anyhow::Result<Vec<(ElementIndex, Vec<u8>)>> {
        let key = subchain.db_key();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT idx, data FROM patterns WHERE subchain = ?1 ORDER BY idx")?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (idx, data) = row?;
                out.push((ElementIndex::try_from(idx).context("parse pattern index")?, data));
            }
            Ok(out)
        })
        .await
    }

    async fn add_patterns(
        &self,
        subchain: &SubchainId,
        patterns: &[(ElementIndex, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let key = subchain.db_key();
        let patterns = patterns.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO patterns(subchain, idx, data) VALUES(?1, ?2, ?3)",
                )?;
                for (idx, data) in &patterns {
                    stmt.execute(params![key, i64::from(*idx), data])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_unspent_outputs(&self, subchain: &SubchainId) -> anyhow::Result<Vec<(OutPoint, Txo)>> {
        let key = subchain.db_key();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT txid, vout, idx, height FROM outputs
                 WHERE subchain = ?1 AND spent_height IS NULL",
            )?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (txid, vout, idx, height) = row?;
                let outpoint = OutPoint {
                    txid: parse_txid(&txid)?,
                    vout: u32::try_from(vout).context("parse vout")?,
                };
                let txo = Txo {
                    index: ElementIndex::try_from(idx).context("parse output owner")?,
                    height: u32::try_from(height).context("parse output height")?,
                };
                out.push((outpoint, txo));
            }
            Ok(out)
        })
        .await
    }

    async fn add_confirmed_transactions(
        &self,
        subchain: &SubchainId,
        position: Position,
        matches: &[TransactionMatch],
    ) -> anyhow::Result<()> {
        let key = subchain.db_key();
        let height = i64::from(position.height);
        let rows: Vec<(String, Vec<(u32, ElementIndex, i64)>, Vec<OutPoint>)> = matches
            .iter()
            .map(|m| {
                let created = m
                    .outputs
                    .iter()
                    .filter_map(|o| o.owner().map(|owner| (o.vout, owner, o.value.to_sat() as i64)))
                    .collect();
                let spent = m.spends.iter().map(|s| s.outpoint).collect();
                (m.txid().to_string(), created, spent)
            })
            .collect();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (txid, created, spent) in &rows {
                for (vout, owner, value) in created {
                    tx.execute(
                        "INSERT OR IGNORE INTO outputs(subchain, txid, vout, idx, height, value)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                        params![key, txid, i64::from(*vout), i64::from(*owner), height, value],
                    )?;
                }
                for outpoint in spent {
                    tx.execute(
                        "UPDATE outputs SET spent_height = ?1
                         WHERE subchain = ?2 AND txid = ?3 AND vout = ?4 AND spent_height IS NULL",
                        params![
                            height,
                            key,
                            outpoint.txid.to_string(),
                            i64::from(outpoint.vout)
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reorg_to(&self, subchain: &SubchainId, ancestor: Position) -> anyhow::Result<()> {
        let key = subchain.db_key();
        self.run(move |conn| {
            let height = i64::from(ancestor.height);
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM outputs WHERE subchain = ?1 AND height > ?2",
                params![key, height],
            )?;
            tx.execute(
                "UPDATE outputs SET spent_height = NULL WHERE subchain = ?1 AND spent_height > ?2",
                params![key, height],
            )?;
            tx.execute(
                "UPDATE last_scanned SET height = ?2, hash = ?3 WHERE subchain = ?1 AND height > ?2",
                params![key, height, ancestor.hash.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
