//! Process wiring: opens the file store, the broker and the mailer from one
//! config and hands out the services built on them.
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::channel::{EventChannel, SqliteBroker, Topology};
use crate::config::Config;
use crate::consumer::NotificationConsumer;
use crate::db::{self, Pool};
use crate::history::HistoryReader;
use crate::ingest::IngestionService;
use crate::mailer::{Mailer, SmtpMailer};

pub struct App {
    pub config: Config,
    pub pool: Pool,
    pub broker: Arc<SqliteBroker>,
    mailer: Arc<dyn Mailer>,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        let mailer = SmtpMailer::from_config(&config.mailer).context("invalid mailer settings")?;
        Self::open_with_mailer(config, Arc::new(mailer)).await
    }

    /// Same as [`App::open`] with a caller-supplied mailer.
    pub async fn open_with_mailer(config: Config, mailer: Arc<dyn Mailer>) -> Result<Self> {
        config.ensure_dirs().context("failed to create data dir")?;

        let pool = db::init_pool(&config.database_url()).await?;
        db::run_migrations(&pool).await?;

        let broker = SqliteBroker::open(
            &config.broker_url(),
            Topology::from(&config.broker),
            config.broker.poll_interval(),
        )
        .await
        .context("failed to open broker")?;
        let topology = broker.topology();
        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            routing_key = %topology.routing_key,
            "file store and broker ready"
        );

        Ok(Self {
            config,
            pool,
            broker: Arc::new(broker),
            mailer,
        })
    }

    pub fn ingestion(&self) -> IngestionService {
        let channel: Arc<dyn EventChannel> = self.broker.clone();
        IngestionService::new(
            self.pool.clone(),
            channel,
            self.config.broker.publish_timeout(),
        )
    }

    pub fn history(&self) -> HistoryReader {
        HistoryReader::new(self.pool.clone(), self.config.history.max_page_size)
    }

    pub fn consumer(&self) -> NotificationConsumer {
        NotificationConsumer::new(
            self.pool.clone(),
            self.mailer.clone(),
            self.config.mailer.subject.clone(),
            self.config.mailer.timeout(),
        )
    }

    /// Close the broker first so subscriptions end, then the file store.
    pub async fn close(&self) {
        self.broker.close().await;
        self.pool.close().await;
    }
}
