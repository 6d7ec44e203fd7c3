//! # Listener registry
//!
//! One row per physical listener: its id (which names its physical channel)
//! and the logical channels it currently wants. Rows are scoped by `class_id`
//! so brokers with different lock namespaces can share a schema without ever
//! sweeping each other's rows.
//!
//! A row is live exactly while some session holds the liveness lock
//! `(class_id, id)`. Rows left behind by crashed processes are removed by any
//! broker of the same class through [`ListenerRegistry::sweep`].

use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::liveness::ClassId;

/// Serialises concurrent `migrate()` calls across processes.
///
/// Single-key advisory locks live in a different key space from the
/// two-key liveness locks, so this never collides with a listener.
const MIGRATION_LOCK_KEY: i64 = 0x7075_6273_7562_6d67; // "pubsubmg"

/// A registry row as seen by diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ListenerRecord {
    pub id: i32,
    pub class_id: i32,
    pub channels: Vec<String>,
    /// Whether the owning session still holds the liveness lock
    pub live: bool,
}

/// SQL access to the `listeners` table of one broker class
#[derive(Debug, Clone)]
pub struct ListenerRegistry {
    schema: String,
    table: String,
    class_id: ClassId,
}

impl ListenerRegistry {
    pub fn new(config: &PubSubConfig) -> Self {
        Self {
            schema: config.schema.clone(),
            table: config.listeners_table(),
            class_id: config.class_id(),
        }
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Quoted, schema-qualified table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotently create the schema, table and index
    #[instrument(skip(self, pool), fields(schema = %self.schema))]
    pub async fn migrate(&self, pool: &PgPool) -> Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id serial PRIMARY KEY, channels text[] NOT NULL DEFAULT '{{}}')",
                self.table
            ),
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS class_id integer NOT NULL DEFAULT 0",
                self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS listeners_class_id_idx ON {} (class_id)",
                self.table
            ),
        ];

        let mut tx = pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!("Listener registry schema is up to date");
        Ok(())
    }

    /// Insert an empty row for a new listener and take its liveness lock
    ///
    /// Both happen in one statement on the executing session, so the row only
    /// becomes visible to other sessions once its lock is already held and a
    /// concurrent sweep can never mistake it for a dead listener.
    pub async fn insert_locked<'c, E>(&self, executor: E) -> Result<i32>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!(
            "WITH ins AS (INSERT INTO {} (class_id, channels) VALUES ($1, ARRAY[]::text[]) RETURNING id) \
             SELECT ins.id FROM ins, LATERAL pg_advisory_lock($1, ins.id)",
            self.table
        );
        let id: i32 = sqlx::query_scalar(&sql)
            .bind(self.class_id.value())
            .fetch_one(executor)
            .await
            .map_err(|e| PubSubError::registry_write("insert", e))?;

        debug!(listener_id = id, class_id = %self.class_id, "Registered listener");
        Ok(id)
    }

    /// Overwrite the channel set of a listener row
    pub async fn update_channels<'c, E>(
        &self,
        executor: E,
        listener_id: i32,
        channels: &[String],
    ) -> Result<()>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!("UPDATE {} SET channels = $1 WHERE id = $2", self.table);
        let updated = sqlx::query(&sql)
            .bind(channels)
            .bind(listener_id)
            .execute(executor)
            .await
            .map_err(|e| PubSubError::registry_write("update", e))?
            .rows_affected();

        // A missing row means no publisher can find this listener any more
        if updated != 1 {
            return Err(PubSubError::registry_write(
                "update",
                sqlx::Error::RowNotFound,
            ));
        }

        debug!(listener_id, channels = ?channels, "Updated listener channels");
        Ok(())
    }

    /// Unconditionally delete one row
    ///
    /// Only used to undo an insert whose listener never came up; live rows are
    /// removed through [`Self::sweep`].
    pub async fn delete<'c, E>(&self, executor: E, listener_id: i32) -> Result<()>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&sql)
            .bind(listener_id)
            .execute(executor)
            .await
            .map_err(|e| PubSubError::registry_write("delete", e))?;
        Ok(())
    }

    /// Delete every row of this class whose liveness lock nobody holds
    pub async fn sweep<'c, E>(&self, executor: E) -> Result<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!(
            "DELETE FROM {} WHERE class_id = $1 AND pg_try_advisory_xact_lock($1, id)",
            self.table
        );
        let removed = sqlx::query(&sql)
            .bind(self.class_id.value())
            .execute(executor)
            .await
            .map_err(|e| PubSubError::registry_write("delete", e))?
            .rows_affected();

        if removed > 0 {
            info!(class_id = %self.class_id, removed, "Swept dead listener rows");
        }
        Ok(removed)
    }

    /// Count rows whose liveness lock is currently held
    pub async fn live_count<'c, E>(&self, executor: E) -> Result<i64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE class_id = $1 AND NOT pg_try_advisory_xact_lock($1, id)",
            self.table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(self.class_id.value())
            .fetch_one(executor)
            .await?;
        Ok(count)
    }

    /// All rows of this class, live or not
    pub async fn list<'c, E>(&self, executor: E) -> Result<Vec<ListenerRecord>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let sql = format!(
            "SELECT id, class_id, channels, NOT pg_try_advisory_xact_lock($1, id) AS live \
             FROM {} WHERE class_id = $1 ORDER BY id",
            self.table
        );
        let records = sqlx::query_as::<_, ListenerRecord>(&sql)
            .bind(self.class_id.value())
            .fetch_all(executor)
            .await?;
        Ok(records)
    }
}
