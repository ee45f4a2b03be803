//! Durable relay state: the registered validator set, per-caller nonce counters and the per-`(caller, nonce)`
//! records which make dispatch and resume idempotent.

use std::path::Path;

use alloy::primitives::{Address, Bytes, U256};
use anyhow::{Result, anyhow};
use rusqlite::{
    Connection, OptionalExtension, ToSql, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use tracing::*;

use crate::{event::CallOutcome, registry::ValidatorRegistry};

/// The persisted state of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceRecord {
    /// Set once the call has been executed on this chain, with what it returned.
    pub dispatched: Option<CallOutcome>,
    /// The nonce was reserved for dispatch but no outcome was recorded. It is never executed again.
    pub reserved: bool,
    /// Set once the result has been delivered to the caller on this chain.
    pub resolved: bool,
}

/// A `U256` stored as a 32-byte big-endian blob, so it sorts and compares like the number.
struct Word(U256);

impl ToSql for Word {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_be_bytes::<32>().to_vec()))
    }
}

impl FromSql for Word {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        if blob.len() != 32 {
            return Err(FromSqlError::InvalidBlobSize {
                expected_size: 32,
                blob_size: blob.len(),
            });
        }
        Ok(Word(U256::from_be_slice(blob)))
    }
}

struct AddressSql(Address);

impl ToSql for AddressSql {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_slice()))
    }
}

impl FromSql for AddressSql {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        if blob.len() != 20 {
            return Err(FromSqlError::InvalidBlobSize {
                expected_size: 20,
                blob_size: blob.len(),
            });
        }
        Ok(AddressSql(Address::from_slice(blob)))
    }
}

#[derive(Debug)]
pub struct NonceLedger {
    db: Connection,
}

impl NonceLedger {
    /// Opens the ledger stored at `path`, creating it if it does not exist. With no path, the ledger lives in
    /// memory and is lost when dropped.
    pub fn open(path: Option<&Path>) -> Result<NonceLedger> {
        let db = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        db.trace_v2(
            rusqlite::trace::TraceEventCodes::SQLITE_TRACE_STMT,
            Some(|statement| {
                if let rusqlite::trace::TraceEvent::Stmt(_, statement) = statement {
                    trace!(statement, "sql executed");
                }
            }),
        );

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS validators (
                idx INTEGER NOT NULL PRIMARY KEY,
                address BLOB NOT NULL UNIQUE);
            CREATE TABLE IF NOT EXISTS caller_nonces (
                caller BLOB NOT NULL PRIMARY KEY,
                next_nonce BLOB NOT NULL);
            CREATE TABLE IF NOT EXISTS nonce_records (
                caller BLOB NOT NULL,
                nonce BLOB NOT NULL,
                dispatched INTEGER NOT NULL DEFAULT 0,
                success INTEGER,
                result BLOB,
                resolved INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (caller, nonce));",
        )?;

        Ok(NonceLedger { db })
    }

    /// Records `registry` as the validator set of this ledger. A ledger which already holds a different set is
    /// refused, since indices in signed quorums would no longer mean the same validators.
    pub fn register_validators(&self, registry: &ValidatorRegistry) -> Result<()> {
        let stored = self.validators()?;
        if stored.is_empty() {
            let tx = self.db.unchecked_transaction()?;
            for (index, address) in registry.validators().iter().enumerate() {
                tx.execute(
                    "INSERT INTO validators (idx, address) VALUES (?1, ?2)",
                    params![index, AddressSql(*address)],
                )?;
            }
            tx.commit()?;
            info!(validators = registry.len(), "registered validator set");
            return Ok(());
        }

        if stored != registry.validators() {
            return Err(anyhow!(
                "ledger was created for a different validator set ({} stored, {} configured)",
                stored.len(),
                registry.len()
            ));
        }
        Ok(())
    }

    pub fn validators(&self) -> rusqlite::Result<Vec<Address>> {
        let mut statement = self
            .db
            .prepare_cached("SELECT address FROM validators ORDER BY idx")?;
        let validators = statement
            .query_map([], |row| row.get::<_, AddressSql>(0).map(|a| a.0))?
            .collect();
        validators
    }

    /// Allocates the next nonce for `caller`. Nonces start at zero and are never handed out twice.
    pub fn allocate_nonce(&self, caller: Address) -> rusqlite::Result<U256> {
        let tx = self.db.unchecked_transaction()?;
        let nonce = tx
            .query_row(
                "SELECT next_nonce FROM caller_nonces WHERE caller = ?1",
                [AddressSql(caller)],
                |row| row.get::<_, Word>(0),
            )
            .optional()?
            .map(|w| w.0)
            .unwrap_or(U256::ZERO);
        tx.execute(
            "INSERT INTO caller_nonces (caller, next_nonce) VALUES (?1, ?2)
            ON CONFLICT (caller) DO UPDATE SET next_nonce = excluded.next_nonce",
            params![AddressSql(caller), Word(nonce + U256::from(1))],
        )?;
        tx.commit()?;
        Ok(nonce)
    }

    pub fn record(&self, caller: Address, nonce: U256) -> rusqlite::Result<NonceRecord> {
        let mut statement = self.db.prepare_cached(
            "SELECT dispatched, success, result, resolved FROM nonce_records
            WHERE caller = ?1 AND nonce = ?2",
        )?;
        let record = statement
            .query_row(params![AddressSql(caller), Word(nonce)], |row| {
                let dispatched: bool = row.get(0)?;
                let success: Option<bool> = row.get(1)?;
                let result: Option<Vec<u8>> = row.get(2)?;
                let resolved: bool = row.get(3)?;
                Ok(NonceRecord {
                    dispatched: success.filter(|_| dispatched).map(|success| CallOutcome {
                        success,
                        result: Bytes::from(result.unwrap_or_default()),
                    }),
                    reserved: dispatched && success.is_none(),
                    resolved,
                })
            })
            .optional()?;
        Ok(record.unwrap_or_default())
    }

    /// Claims `(caller, nonce)` for dispatch, before the call runs. Returns `false` if it was claimed already.
    pub fn reserve_dispatch(&self, caller: Address, nonce: U256) -> rusqlite::Result<bool> {
        let changed = self.db.execute(
            "INSERT INTO nonce_records (caller, nonce, dispatched) VALUES (?1, ?2, 1)
            ON CONFLICT (caller, nonce) DO UPDATE SET dispatched = 1
            WHERE nonce_records.dispatched = 0",
            params![AddressSql(caller), Word(nonce)],
        )?;
        Ok(changed == 1)
    }

    /// Records the outcome of a reserved dispatch. Returns `false` and leaves the record untouched if the nonce
    /// was not reserved or already has an outcome.
    pub fn mark_dispatched(
        &self,
        caller: Address,
        nonce: U256,
        outcome: &CallOutcome,
    ) -> rusqlite::Result<bool> {
        let changed = self.db.execute(
            "UPDATE nonce_records SET success = ?3, result = ?4
            WHERE caller = ?1 AND nonce = ?2 AND dispatched = 1 AND success IS NULL",
            params![
                AddressSql(caller),
                Word(nonce),
                outcome.success,
                outcome.result.as_ref()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Marks `(caller, nonce)` as resolved. Returns `false` if it already was.
    pub fn mark_resolved(&self, caller: Address, nonce: U256) -> rusqlite::Result<bool> {
        let changed = self.db.execute(
            "INSERT INTO nonce_records (caller, nonce, resolved) VALUES (?1, ?2, 1)
            ON CONFLICT (caller, nonce) DO UPDATE SET resolved = 1
            WHERE nonce_records.resolved = 0",
            params![AddressSql(caller), Word(nonce)],
        )?;
        Ok(changed == 1)
    }
}
