#![allow(dead_code)]

use pg_pubsub::{Message, PubSub, PubSubConfig, Subscription};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// How long a test waits for a notification before giving up
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits to be confident nothing else arrives
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Test database utilities for broker integration tests
///
/// Every test gets its own registry schema and channel prefix, so tests can
/// run in parallel against one database without seeing each other.
#[derive(Debug)]
pub struct TestDb {
    pub pool: PgPool,
    pub test_id: String,
    pub schema: String,
}

impl TestDb {
    /// Connect using `DATABASE_URL`; `None` when it is unset so tests can skip
    pub async fn new() -> Option<Self> {
        let Some(database_url) = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
        else {
            eprintln!("DATABASE_URL not set, skipping database test");
            return None;
        };

        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        let test_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let schema = format!("pubsub_test_{}", test_id);

        Some(TestDb {
            pool,
            test_id,
            schema,
        })
    }

    /// Configuration for a broker of class `name` in this test's namespace
    pub fn config(&self, name: &str) -> PubSubConfig {
        PubSubConfig::new()
            .with_name(format!("{}_{}", name, self.test_id))
            .with_schema(&self.schema)
            .with_channel_prefix(format!("ps{}_", self.test_id))
    }

    /// Migrated broker of class `name`
    pub async fn broker(&self, name: &str) -> PubSub {
        let broker = PubSub::new(self.pool.clone(), self.config(name))
            .expect("Failed to create broker");
        broker.migrate().await.expect("Failed to migrate registry");
        broker
    }

    /// Number of registry rows regardless of class or liveness
    pub async fn registry_rows(&self) -> i64 {
        sqlx::query_scalar(&format!("SELECT count(*) FROM \"{}\".listeners", self.schema))
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count registry rows")
    }

    /// Drop this test's schema
    pub async fn cleanup(&self) {
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", self.schema))
            .execute(&self.pool)
            .await;
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        // Best effort when a test panicked before calling cleanup()
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let schema = self.schema.clone();
            handle.spawn(async move {
                let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema))
                    .execute(&pool)
                    .await;
            });
        }
    }
}

/// Next message on `subscription`, failing the test on timeout
pub async fn expect_message(subscription: &mut Subscription) -> Message {
    tokio::time::timeout(RECEIVE_TIMEOUT, subscription.recv())
        .await
        .expect("Timed out waiting for notification")
        .expect("Subscription ended unexpectedly")
        .expect("Delivery failed")
}

/// Assert nothing arrives on `subscription` within the quiet period
pub async fn expect_silence(subscription: &mut Subscription) {
    if let Ok(Some(message)) = tokio::time::timeout(QUIET_PERIOD, subscription.recv()).await {
        panic!("Unexpected delivery: {:?}", message);
    }
}
