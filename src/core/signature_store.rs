//! Durable, transactional store of the last applied signature per stage.
//!
//! A record exists for a stage iff its last `execute()` succeeded under the
//! stored signature. Every read and write goes through a transaction;
//! dropping a transaction without committing rolls it back.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::domain::{Signature, StageId, StageRecord};

use super::error::StoreError;

/// Backend holding stage records
pub trait SignatureStore {
    /// Start a transaction against the store
    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// Read/write access to the store inside one transaction
pub trait StoreTransaction {
    /// Last recorded signature, or `None` if the stage never completed
    fn get(&self, stage: &StageId) -> Result<Option<Signature>, StoreError>;

    /// Insert or replace the record for a stage
    fn put(&mut self, stage: &StageId, signature: &Signature) -> Result<(), StoreError>;

    /// Remove the record for a stage (no-op if absent)
    fn delete(&mut self, stage: &StageId) -> Result<(), StoreError>;

    /// All records, ordered by stage identity
    fn records(&self) -> Result<Vec<StageRecord>, StoreError>;

    /// Durably commit every change made in this transaction
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

impl<'s> dyn SignatureStore + 's {
    /// Run `f` inside a transaction
    ///
    /// Commits when `f` returns `Ok`; on `Err` the transaction is dropped
    /// (rolled back) and the error is returned unchanged.
    pub fn with_transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin()?;
        let value = f(&mut *tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// SQLite-backed signature store
pub struct SqliteSignatureStore {
    conn: Connection,
}

impl SqliteSignatureStore {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS stage_signatures (
            stage_identity TEXT PRIMARY KEY NOT NULL,
            signature TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );
    ";

    /// Open or create the store database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::initialize(conn)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self { conn })
    }
}

impl SignatureStore for SqliteSignatureStore {
    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let tx = self.conn.transaction()?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

struct SqliteTransaction<'c> {
    tx: Transaction<'c>,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn get(&self, stage: &StageId) -> Result<Option<Signature>, StoreError> {
        let raw: Option<String> = self
            .tx
            .query_row(
                "SELECT signature FROM stage_signatures WHERE stage_identity = ?1",
                params![stage.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(text) => Ok(Some(Signature::parse(&text)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, stage: &StageId, signature: &Signature) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO stage_signatures (stage_identity, signature, recorded_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(stage_identity) DO UPDATE SET
                 signature = excluded.signature,
                 recorded_at = excluded.recorded_at",
            params![
                stage.as_str(),
                signature.canonical(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn delete(&mut self, stage: &StageId) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM stage_signatures WHERE stage_identity = ?1",
            params![stage.as_str()],
        )?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<StageRecord>, StoreError> {
        let mut stmt = self.tx.prepare(
            "SELECT stage_identity, signature, recorded_at
             FROM stage_signatures ORDER BY stage_identity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (stage, signature, recorded_at) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map_err(|_| StoreError::InvalidTimestamp {
                    stage: stage.clone(),
                    value: recorded_at.clone(),
                })?
                .with_timezone(&Utc);

            records.push(StageRecord {
                stage: StageId::from(stage),
                signature: Signature::parse(&signature)?,
                recorded_at,
            });
        }

        Ok(records)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }
}
