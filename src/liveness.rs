//! # Liveness lock
//!
//! Every physical listener holds a session-scoped advisory lock keyed by
//! `(class_id, listener_id)` for as long as its connection is open. Another
//! session proves the listener dead by momentarily acquiring the same key with
//! `pg_try_advisory_xact_lock`; when the attempt fails, somebody still holds it.
//!
//! Transaction-scoped attempts release at the end of the enclosing transaction.
//! A statement issued outside an explicit transaction runs in its own implicit
//! one, so the probe never outlives the statement that made it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Executor, Postgres};
use std::fmt;

use crate::error::Result;

/// Advisory-lock namespace shared by every listener of one broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassId(i32);

impl ClassId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Derive a class id from a broker name
    ///
    /// The last four bytes of the SHA-256 digest, read big-endian. Stable across
    /// processes and releases, so brokers with the same name always share a
    /// namespace and differently named brokers almost never do.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let tail: [u8; 4] = [digest[28], digest[29], digest[30], digest[31]];
        Self(i32::from_be_bytes(tail))
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two-integer advisory lock key of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub class_id: ClassId,
    pub listener_id: i32,
}

impl LockKey {
    pub const fn new(class_id: ClassId, listener_id: i32) -> Self {
        Self {
            class_id,
            listener_id,
        }
    }

    /// Release the session lock held by the executing session
    ///
    /// Returns whether the lock was actually held by this session.
    pub async fn release<'c, E>(&self, executor: E) -> Result<bool>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
            .bind(self.class_id.value())
            .bind(self.listener_id)
            .fetch_one(executor)
            .await?;
        Ok(released)
    }

    /// Probe from another session whether the owning listener is still alive
    pub async fn is_held<'c, E>(&self, executor: E) -> Result<bool>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1, $2)")
            .bind(self.class_id.value())
            .bind(self.listener_id)
            .fetch_one(executor)
            .await?;
        Ok(!acquired)
    }
}
