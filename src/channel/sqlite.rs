//! Durable broker backed by its own SQLite database.
//!
//! Exchanges, queues and bindings are rows, so they survive restarts. Routing
//! is direct: a message goes to every queue bound under its exact routing key.
//! Subscribers poll their queue and take the oldest message with a single
//! `DELETE ... RETURNING`, which is the acknowledgment.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::Row;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{ChannelError, Deliveries, Delivery, EventChannel, Topology, JSON_CONTENT_TYPE};
use crate::db::{self, Pool};
use crate::model::DeliveryEvent;

const EXCHANGE_KIND_DIRECT: &str = "direct";

pub struct SqliteBroker {
    pool: Pool,
    topology: Topology,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for SqliteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBroker")
            .field("topology", &self.topology)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl SqliteBroker {
    /// Open the broker database at `url` and declare `topology`.
    pub async fn open(
        url: &str,
        topology: Topology,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        let pool = db::init_pool(url).await.map_err(ChannelError::Open)?;
        Self::with_pool(pool, topology, poll_interval).await
    }

    pub async fn with_pool(
        pool: Pool,
        topology: Topology,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        sqlx::migrate!("./migrations/broker").run(&pool).await?;
        let (shutdown, _) = watch::channel(false);
        let broker = Self {
            pool,
            topology,
            poll_interval,
            shutdown,
        };
        broker.declare().await?;
        Ok(broker)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Declare the durable exchange, the durable queue and their binding.
    #[instrument(skip_all, fields(exchange = %self.topology.exchange, queue = %self.topology.queue))]
    pub async fn declare(&self) -> Result<(), ChannelError> {
        let t = &self.topology;
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO broker_exchanges (name, kind, durable) VALUES (?, ?, 1)")
            .bind(&t.exchange)
            .bind(EXCHANGE_KIND_DIRECT)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO broker_queues (name, durable) VALUES (?, 1)")
            .bind(&t.queue)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO broker_bindings (exchange, queue, routing_key) VALUES (?, ?, ?)",
        )
        .bind(&t.exchange)
        .bind(&t.queue)
        .bind(&t.routing_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(routing_key = %t.routing_key, "declared exchange, queue and binding");
        Ok(())
    }

    /// Route `body` through `exchange` under `routing_key`. Returns the number
    /// of queues that received a copy; zero means the message was unroutable
    /// and has been dropped.
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut tx = self.pool.begin().await?;
        let declared: Option<String> =
            sqlx::query_scalar("SELECT kind FROM broker_exchanges WHERE name = ?")
                .bind(exchange)
                .fetch_optional(&mut *tx)
                .await?;
        if declared.is_none() {
            return Err(ChannelError::UnknownExchange(exchange.to_string()));
        }

        let queues: Vec<String> = sqlx::query_scalar(
            "SELECT queue FROM broker_bindings WHERE exchange = ? AND routing_key = ? ORDER BY queue",
        )
        .bind(exchange)
        .bind(routing_key)
        .fetch_all(&mut *tx)
        .await?;

        let message_id = Uuid::new_v4();
        for queue in &queues {
            sqlx::query(
                "INSERT INTO broker_messages (message_id, queue, exchange, routing_key, content_type, body) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(queue)
            .bind(exchange)
            .bind(routing_key)
            .bind(JSON_CONTENT_TYPE)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if queues.is_empty() {
            warn!(%message_id, "no queue bound for routing key; message dropped");
        } else {
            debug!(%message_id, queues = queues.len(), "message enqueued");
        }
        Ok(queues.len())
    }

    /// Messages waiting in the subscribed queue.
    pub async fn queue_depth(&self) -> Result<i64, ChannelError> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broker_messages WHERE queue = ?")
            .bind(&self.topology.queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }

    /// Stop every subscription and close the database. Messages still queued
    /// stay on disk; messages already handed to a subscriber are gone.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.pool.close().await;
        info!(queue = %self.topology.queue, "broker closed");
    }
}

/// Take the oldest message of `queue`. Removing the row is the ack.
async fn take_next(pool: &Pool, queue: &str) -> Result<Option<Delivery>, ChannelError> {
    let row = sqlx::query(
        "DELETE FROM broker_messages \
         WHERE id = (SELECT id FROM broker_messages WHERE queue = ? ORDER BY id ASC LIMIT 1) \
         RETURNING id, message_id, exchange, routing_key, content_type, body, enqueued_at",
    )
    .bind(queue)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let delivery_tag: i64 = row.try_get("id")?;
    let raw_id: String = row.try_get("message_id")?;
    let message_id =
        Uuid::parse_str(&raw_id).map_err(|source| ChannelError::CorruptMessageId {
            delivery_tag,
            message_id: raw_id.clone(),
            source,
        })?;
    Ok(Some(Delivery {
        delivery_tag,
        message_id,
        exchange: row.try_get("exchange")?,
        routing_key: row.try_get("routing_key")?,
        content_type: row.try_get("content_type")?,
        body: row.try_get("body")?,
        enqueued_at: row.try_get("enqueued_at")?,
    }))
}

async fn poll_queue(
    pool: Pool,
    queue: String,
    poll_interval: Duration,
    tx: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        // Only take a message once the subscriber has room for it.
        let permit = tokio::select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        let idle = match take_next(&pool, &queue).await {
            Ok(Some(delivery)) => {
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    message_id = %delivery.message_id,
                    "message handed to subscriber"
                );
                permit.send(delivery);
                false
            }
            Ok(None) => true,
            Err(err @ ChannelError::CorruptMessageId { .. }) => {
                error!(error = %err, %queue, "dropping corrupt message");
                false
            }
            Err(err) => {
                warn!(?err, %queue, "failed to poll broker queue");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
    debug!(%queue, "subscription ended");
}

#[async_trait]
impl EventChannel for SqliteBroker {
    async fn publish(&self, event: &DeliveryEvent) -> Result<(), ChannelError> {
        let body = event.to_json()?;
        self.publish_raw(&self.topology.exchange, &self.topology.routing_key, &body)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Deliveries, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(poll_queue(
            self.pool.clone(),
            self.topology.queue.clone(),
            self.poll_interval,
            tx,
            self.shutdown.subscribe(),
        ));
        info!(queue = %self.topology.queue, "subscribed with auto-ack");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);

    async fn memory_broker() -> SqliteBroker {
        SqliteBroker::open("sqlite::memory:", Topology::default(), POLL)
            .await
            .unwrap()
    }

    fn event(id: i64) -> DeliveryEvent {
        DeliveryEvent {
            id,
            name: format!("file-{id}.txt"),
            size: 4,
            content_base64: "dGVzdA==".into(),
            owner_id: 7,
            created_at: Utc::now(),
            email_recipient: "a@b.com".into(),
        }
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = memory_broker().await;
        broker.declare().await.unwrap();
        broker.declare().await.unwrap();
        let bindings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broker_bindings")
            .fetch_one(&broker.pool)
            .await
            .unwrap();
        assert_eq!(bindings, 1);
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let broker = memory_broker().await;
        broker.publish(&event(1)).await.unwrap();
        assert_eq!(broker.queue_depth().await.unwrap(), 1);

        let content_type: String =
            sqlx::query_scalar("SELECT content_type FROM broker_messages LIMIT 1")
                .fetch_one(&broker.pool)
                .await
                .unwrap();
        assert_eq!(content_type, JSON_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn unroutable_message_is_dropped() {
        let broker = memory_broker().await;
        let routed = broker
            .publish_raw(super::super::DEFAULT_EXCHANGE, "other.key", b"{}")
            .await
            .unwrap();
        assert_eq!(routed, 0);
        assert_eq!(broker.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_exchange_is_an_error() {
        let broker = memory_broker().await;
        let err = broker
            .publish_raw("missing", super::super::DEFAULT_ROUTING_KEY, b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownExchange(name) if name == "missing"));
    }

    #[tokio::test]
    async fn corrupt_message_id_is_an_error_not_a_nil_id() {
        let broker = memory_broker().await;
        let t = broker.topology().clone();
        sqlx::query(
            "INSERT INTO broker_messages (message_id, queue, exchange, routing_key, content_type, body) \
             VALUES ('not-a-uuid', ?, ?, ?, ?, ?)",
        )
        .bind(&t.queue)
        .bind(&t.exchange)
        .bind(&t.routing_key)
        .bind(JSON_CONTENT_TYPE)
        .bind(b"{}".as_slice())
        .execute(&broker.pool)
        .await
        .unwrap();

        let err = take_next(&broker.pool, &t.queue).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::CorruptMessageId { ref message_id, .. } if message_id == "not-a-uuid"
        ));
        assert_eq!(broker.queue_depth().await.unwrap(), 0);

        // The next good message still flows.
        broker.publish(&event(2)).await.unwrap();
        let mut deliveries = broker.subscribe().await.unwrap();
        let d = timeout(Duration::from_secs(2), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(DeliveryEvent::from_json(&d.body).unwrap().id, 2);
    }

    #[tokio::test]
    async fn delivery_removes_message_from_queue() {
        let broker = memory_broker().await;
        let published = event(1);
        broker.publish(&published).await.unwrap();

        let mut deliveries = broker.subscribe().await.unwrap();
        let delivery = timeout(Duration::from_secs(2), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(DeliveryEvent::from_json(&delivery.body).unwrap(), published);
        assert_ne!(delivery.message_id, Uuid::nil());
        assert_eq!(broker.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deliveries_keep_publish_order() {
        let broker = memory_broker().await;
        for id in 1..=3 {
            broker.publish(&event(id)).await.unwrap();
        }
        let mut deliveries = broker.subscribe().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let d = timeout(Duration::from_secs(2), deliveries.next())
                .await
                .unwrap()
                .unwrap();
            ids.push(DeliveryEvent::from_json(&d.body).unwrap().id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn competing_subscribers_each_message_once() {
        let broker = memory_broker().await;
        let mut a = broker.subscribe().await.unwrap();
        let mut b = broker.subscribe().await.unwrap();
        for id in 1..=6 {
            broker.publish(&event(id)).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 6 {
            let next = tokio::select! {
                d = a.next() => d,
                d = b.next() => d,
                _ = tokio::time::sleep(Duration::from_secs(2)) => None,
            };
            let Some(d) = next else { break };
            seen.push(DeliveryEvent::from_json(&d.body).unwrap().id);
        }
        assert_eq!(seen.len(), 6);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 6);
    }

    #[tokio::test]
    async fn close_ends_subscription_and_rejects_publish() {
        let broker = memory_broker().await;
        let mut deliveries = broker.subscribe().await.unwrap();
        broker.close().await;

        let end = timeout(Duration::from_secs(2), deliveries.next()).await.unwrap();
        assert!(end.is_none());
        assert!(matches!(
            broker.publish(&event(1)).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(broker.subscribe().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn queued_messages_survive_reopen() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", td.path().join("broker.db").display());

        let broker = SqliteBroker::open(&url, Topology::default(), POLL)
            .await
            .unwrap();
        broker.publish(&event(1)).await.unwrap();
        broker.close().await;

        let reopened = SqliteBroker::open(&url, Topology::default(), POLL)
            .await
            .unwrap();
        assert_eq!(reopened.queue_depth().await.unwrap(), 1);
        let mut deliveries = reopened.subscribe().await.unwrap();
        let delivery = timeout(Duration::from_secs(2), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(DeliveryEvent::from_json(&delivery.body).unwrap().id, 1);
        reopened.close().await;
    }
}
