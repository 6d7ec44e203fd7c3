//! End-to-end broker behaviour against a real PostgreSQL
//!
//! Skipped when `DATABASE_URL` is unset.

mod common;

use common::{expect_message, expect_silence, TestDb, RECEIVE_TIMEOUT};
use futures::StreamExt;
use pg_pubsub::{PubSub, PubSubError};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

macro_rules! test_db {
    () => {
        match TestDb::new().await {
            Some(db) => db,
            None => return,
        }
    };
}

#[tokio::test]
async fn test_subscriber_receives_published_message() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let mut subscription = broker.subscribe("orders.created").await.unwrap();
    let notified = broker
        .publish("orders.created", &[json!("order-42")])
        .await
        .unwrap();
    assert_eq!(notified, 1);

    let message = expect_message(&mut subscription).await;
    assert_eq!(message.channel, "orders.created");
    assert_eq!(message.data, vec![json!("order-42")]);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_unsubscribed_channel_is_not_delivered() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let mut created = broker.subscribe("orders.created").await.unwrap();
    broker
        .publish("orders.cancelled", &[json!("order-7")])
        .await
        .unwrap();
    broker
        .publish("orders.created", &[json!("order-8")])
        .await
        .unwrap();

    // Only the subscribed channel arrives, in publish order
    let message = expect_message(&mut created).await;
    assert_eq!(message.data, vec![json!("order-8")]);
    expect_silence(&mut created).await;

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_fan_out_to_every_subscription() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let mut first = broker.subscribe("orders.created").await.unwrap();
    let mut second = broker.subscribe("orders.created").await.unwrap();

    // One physical listener serves both subscriptions
    let notified = broker
        .publish("orders.created", &[json!({"id": 1, "lines": [1, 2, 3]})])
        .await
        .unwrap();
    assert_eq!(notified, 1);

    for subscription in [&mut first, &mut second] {
        let message = expect_message(subscription).await;
        assert_eq!(message.data, vec![json!({"id": 1, "lines": [1, 2, 3]})]);
        expect_silence(subscription).await;
    }

    let stats = broker.stats();
    assert_eq!(stats.channels, 1);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(stats.listener.notifications_received, 1);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let leaving = broker.subscribe("orders.created").await.unwrap();
    let mut staying = broker.subscribe("orders.shipped").await.unwrap();
    let listener_id = broker.listener_id().unwrap();

    broker.unsubscribe(leaving).await.unwrap();

    // The listener stays up for the remaining channel but no longer asks for the other
    assert_eq!(broker.listener_id(), Some(listener_id));
    let records = broker.listeners().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].channels, vec!["orders.shipped".to_string()]);

    let notified = broker
        .publish("orders.created", &[json!("order-1")])
        .await
        .unwrap();
    assert_eq!(notified, 0);

    broker
        .publish("orders.shipped", &[json!("order-2")])
        .await
        .unwrap();
    let message = expect_message(&mut staying).await;
    assert_eq!(message.data, vec![json!("order-2")]);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_last_unsubscribe_closes_listener() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let subscription = broker.subscribe("orders.created").await.unwrap();
    assert!(broker.listener_id().is_some());
    assert_eq!(broker.status().await.unwrap().live_listeners, 1);

    subscription.unsubscribe().await.unwrap();

    assert_eq!(broker.listener_id(), None);
    assert!(!broker.stats().listener.connected);
    assert_eq!(broker.status().await.unwrap().live_listeners, 0);
    assert_eq!(db.registry_rows().await, 0);

    // Subscribing again brings a fresh listener up
    let mut again = broker.subscribe("orders.created").await.unwrap();
    broker
        .publish("orders.created", &[json!("order-3")])
        .await
        .unwrap();
    assert_eq!(expect_message(&mut again).await.data, vec![json!("order-3")]);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_dead_listener_row_is_swept_by_another_instance() {
    let db = test_db!();
    let first = db.broker("Orders").await;
    let second = db.broker("Orders").await;
    assert_eq!(first.class_id(), second.class_id());

    let _subscription = first.subscribe("orders.created").await.unwrap();

    // A row nobody holds the lock for, as left behind by a crashed process
    let table = format!("\"{}\".listeners", db.schema);
    sqlx::query(&format!(
        "INSERT INTO {} (class_id, channels) VALUES ($1, ARRAY['orders.created'])",
        table
    ))
    .bind(first.class_id().value())
    .execute(&db.pool)
    .await
    .unwrap();
    assert_eq!(db.registry_rows().await, 2);

    let records = second.listeners().await.unwrap();
    assert_eq!(records.iter().filter(|record| record.live).count(), 1);

    // The live row survives the sweep, the dead one does not
    assert_eq!(second.sweep().await.unwrap(), 1);
    assert_eq!(db.registry_rows().await, 1);
    assert_eq!(
        second.listeners().await.unwrap()[0].id,
        first.listener_id().unwrap()
    );

    first.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_publish_without_listeners_is_a_no_op() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let notified = broker.publish("nobody.listens", &[json!(1)]).await.unwrap();
    assert_eq!(notified, 0);
    assert_eq!(broker.status().await.unwrap().live_listeners, 0);

    db.cleanup().await;
}

#[tokio::test]
async fn test_namespace_isolation_between_classes() {
    let db = test_db!();
    let orders = db.broker("Orders").await;
    let billing = db.broker("Billing").await;
    assert_ne!(orders.class_id(), billing.class_id());

    let mut orders_sub = orders.subscribe("orders.created").await.unwrap();
    let mut billing_sub = billing.subscribe("orders.created").await.unwrap();
    assert_ne!(orders.listener_id(), billing.listener_id());

    // Each class only sees and sweeps its own rows
    assert_eq!(orders.status().await.unwrap().live_listeners, 1);
    assert_eq!(billing.status().await.unwrap().live_listeners, 1);
    assert_eq!(billing.sweep().await.unwrap(), 0);
    assert_eq!(db.registry_rows().await, 2);

    let notified = orders
        .publish("orders.created", &[json!("order-42")])
        .await
        .unwrap();
    assert_eq!(notified, 1);
    assert_eq!(
        expect_message(&mut orders_sub).await.data,
        vec![json!("order-42")]
    );
    expect_silence(&mut billing_sub).await;

    orders.shutdown().await;
    billing.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_transactional_publish_follows_commit() {
    let db = test_db!();
    let broker = db.broker("Orders").await;
    let mut subscription = broker.subscribe("orders.created").await.unwrap();

    let mut tx = db.pool.begin().await.unwrap();
    broker
        .publish_with(&mut *tx, "orders.created", &[json!("rolled-back")])
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    expect_silence(&mut subscription).await;

    let mut tx = db.pool.begin().await.unwrap();
    broker
        .publisher("Orders")
        .channel("orders.created")
        .publish_event_with(&mut *tx, "created", &[json!("committed")])
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        expect_message(&mut subscription).await.data,
        vec![json!("committed")]
    );

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_subscription_as_stream_ends_on_shutdown() {
    let db = test_db!();
    let broker = db.broker("Orders").await;
    let mut subscription = broker.subscribe("orders.created").await.unwrap();

    broker
        .publish_values("orders.created", &("order-9", 3, true))
        .await
        .unwrap();
    let message = subscription.next().await.unwrap().unwrap();
    let (id, quantity, paid): (String, u32, bool) = message.decode().unwrap();
    assert_eq!((id.as_str(), quantity, paid), ("order-9", 3, true));

    broker.shutdown().await;
    assert!(subscription.next().await.is_none());
    assert_eq!(db.registry_rows().await, 0);

    db.cleanup().await;
}

#[tokio::test]
async fn test_oversized_publish_fails_before_database() {
    let db = test_db!();
    let broker = db.broker("Orders").await;
    let _subscription = broker.subscribe("orders.created").await.unwrap();

    let err = broker
        .publish("orders.created", &[json!("x".repeat(9000))])
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::OversizedPayload { .. }));
    assert_eq!(broker.stats().listener.notifications_received, 0);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_clones_share_one_listener() {
    let db = test_db!();
    let broker = db.broker("Orders").await;
    let clone: PubSub = broker.clone();

    let _a = broker.subscribe("a").await.unwrap();
    let _b = clone.subscribe("b").await.unwrap();
    assert_eq!(broker.listener_id(), clone.listener_id());
    assert_eq!(db.registry_rows().await, 1);

    let mut channels = broker.listeners().await.unwrap()[0].channels.clone();
    channels.sort();
    assert_eq!(channels, vec!["a".to_string(), "b".to_string()]);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_subscribe_survives_concurrent_sweeps() {
    let db = test_db!();
    let sweeper = db.broker("Orders").await;
    let broker = db.broker("Orders").await;

    let stop = Arc::new(AtomicBool::new(false));
    let sweeping = tokio::spawn({
        let stop = Arc::clone(&stop);
        async move {
            while !stop.load(Ordering::Relaxed) {
                sweeper.sweep().await.unwrap();
                tokio::task::yield_now().await;
            }
        }
    });

    for round in 0..50 {
        let mut subscription = broker.subscribe("c").await.unwrap();
        let listener_id = broker.listener_id().unwrap();

        let records = broker.listeners().await.unwrap();
        let own = records.iter().find(|record| record.id == listener_id);
        assert!(own.is_some(), "registry row of listener {} missing in round {}", listener_id, round);
        assert!(own.unwrap().live);

        let notified = broker.publish("c", &[json!(round)]).await.unwrap();
        assert!(notified >= 1, "nobody notified in round {}", round);
        assert_eq!(expect_message(&mut subscription).await.data, vec![json!(round)]);

        subscription.unsubscribe().await.unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    sweeping.await.unwrap();
    db.cleanup().await;
}

#[tokio::test]
async fn test_dropped_subscription_releases_listener() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let subscription = broker.subscribe("orders.created").await.unwrap();
    assert_eq!(db.registry_rows().await, 1);
    drop(subscription);

    // Release runs in the background; wait for it to settle
    let mut released = false;
    for _ in 0..100 {
        if broker.listener_id().is_none() && db.registry_rows().await == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(released, "dropped subscription did not release the listener");
    assert_eq!(broker.status().await.unwrap().live_listeners, 0);
    assert_eq!(broker.stats().subscriptions, 0);

    db.cleanup().await;
}

#[tokio::test]
async fn test_connection_loss_reports_and_recovers() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let mut subscription = broker.subscribe("orders.created").await.unwrap();
    let lost_id = broker.listener_id().unwrap();

    let terminated: bool = sqlx::query_scalar(
        "SELECT pg_terminate_backend(pid) FROM pg_locks WHERE locktype = 'advisory' AND granted \
         AND classid = $1::int4::oid AND objid = $2::int4::oid AND objsubid = 2",
    )
    .bind(broker.class_id().value())
    .bind(lost_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert!(terminated);

    let delivery = tokio::time::timeout(RECEIVE_TIMEOUT, subscription.recv())
        .await
        .expect("Timed out waiting for connection loss")
        .expect("Subscription ended without reporting the loss");
    assert!(matches!(
        delivery,
        Err(PubSubError::ConnectionLost { listener_id }) if listener_id == lost_id
    ));
    assert!(subscription.recv().await.is_none());
    assert_eq!(broker.stats().listener.connection_errors, 1);
    drop(subscription);

    // The next subscribe replaces the dead listener and sweeps its row
    let mut again = broker.subscribe("orders.created").await.unwrap();
    let new_id = broker.listener_id().unwrap();
    assert_ne!(new_id, lost_id);

    broker
        .publish("orders.created", &[json!("after-recovery")])
        .await
        .unwrap();
    assert_eq!(
        expect_message(&mut again).await.data,
        vec![json!("after-recovery")]
    );
    let records = broker.listeners().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, new_id);

    broker.shutdown().await;
    db.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_churn_keeps_registry_in_step() {
    let db = test_db!();
    let broker = db.broker("Orders").await;

    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let broker = broker.clone();
            tokio::spawn(async move {
                let channel = format!("churn.{}", n);
                for _ in 0..10 {
                    let subscription = broker.subscribe(&channel).await.unwrap();
                    subscription.unsubscribe().await.unwrap();
                }
                if n % 2 == 0 {
                    Some(broker.subscribe(&format!("kept.{}", n)).await.unwrap())
                } else {
                    None
                }
            })
        })
        .collect();

    let mut kept = Vec::new();
    for task in tasks {
        kept.extend(task.await.unwrap());
    }

    let mut expected: Vec<String> = kept
        .iter()
        .map(|subscription| subscription.channel().to_string())
        .collect();
    expected.sort();

    let records = broker.listeners().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, broker.listener_id().unwrap());
    let mut registered = records[0].channels.clone();
    registered.sort();
    assert_eq!(registered, expected);

    let stats = broker.stats();
    assert_eq!(stats.channels, expected.len());
    assert_eq!(stats.subscriptions, expected.len());

    broker.shutdown().await;
    db.cleanup().await;
}
