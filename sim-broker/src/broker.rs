// Copyright 2021-2022 the sim-archive authors.
// This file is part of sim-archive.

// sim-archive is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// sim-archive is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with sim-archive.  If not, see <http://www.gnu.org/licenses/>.

//! One durable topic. All topics created against the same database share the
//! `topic_messages`/`topic_acks` tables and are told apart by the `topic`
//! column; each `Broker` value owns its own pool and listener task.

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::Mutex;
use serde::Deserialize;
use sqlx::{
	postgres::{PgPool, PgPoolOptions},
	Executor, Row,
};

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics};

use crate::{
	error::{BrokerError, Result},
	listener::{Listener, Router},
	publisher::Publisher,
	subscriber::Subscriber,
};

/// Everything messages and acks live in. Idempotent: safe to run on every
/// broker open, shared by all topics on the database.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS topic_messages (
	id BIGSERIAL PRIMARY KEY,
	topic TEXT NOT NULL,
	message_id TEXT NOT NULL,
	ts_ms BIGINT NOT NULL,
	envelope BYTEA NOT NULL,
	claimed_by TEXT,
	claimed_at TIMESTAMPTZ,
	created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
	UNIQUE (topic, message_id)
);

CREATE INDEX IF NOT EXISTS topic_messages_topic_id ON topic_messages (topic, id);

CREATE TABLE IF NOT EXISTS topic_acks (
	topic TEXT NOT NULL,
	consumer_group TEXT NOT NULL,
	message_id TEXT NOT NULL,
	acked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
	PRIMARY KEY (topic, consumer_group, message_id)
);

CREATE OR REPLACE FUNCTION sim_topic_notify() RETURNS trigger AS $$
BEGIN
	PERFORM pg_notify('sim_topic_messages', json_build_object('topic', NEW.topic, 'id', NEW.id)::text);
	RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS sim_topic_notify ON topic_messages;
CREATE TRIGGER sim_topic_notify AFTER INSERT ON topic_messages
	FOR EACH ROW EXECUTE PROCEDURE sim_topic_notify();
"#;

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
	/// Postgres url the topic tables live on.
	pub db_url: String,
	#[serde(default = "default_max_pool_size")]
	pub max_pool_size: u32,
	#[serde(default = "default_min_idle")]
	pub min_idle: u32,
	/// Seconds before an unacked claim becomes eligible for reassignment.
	/// 0 disables stuck recovery.
	#[serde(default)]
	pub claim_timeout_seconds: u64,
	/// How often a waiting subscriber re-checks the database when no
	/// notification arrives. Bounds both notification loss and the stuck
	/// reassignment latency.
	#[serde(default = "default_recheck_ms")]
	pub recheck_interval_ms: u64,
	#[serde(default = "default_metrics_window")]
	pub metrics_window_seconds: usize,
}

const fn default_max_pool_size() -> u32 {
	10
}

const fn default_min_idle() -> u32 {
	1
}

const fn default_recheck_ms() -> u64 {
	1_000
}

const fn default_metrics_window() -> usize {
	sim_archive_common::metrics::DEFAULT_WINDOW_SECONDS
}

impl BrokerConfig {
	pub fn new(db_url: impl Into<String>) -> Self {
		Self {
			db_url: db_url.into(),
			max_pool_size: default_max_pool_size(),
			min_idle: default_min_idle(),
			claim_timeout_seconds: 0,
			recheck_interval_ms: default_recheck_ms(),
			metrics_window_seconds: default_metrics_window(),
		}
	}

	pub fn claim_timeout(&self) -> Duration {
		Duration::from_secs(self.claim_timeout_seconds)
	}

	pub fn recheck_interval(&self) -> Duration {
		Duration::from_millis(self.recheck_interval_ms.max(10))
	}
}

pub struct Broker {
	topic: String,
	config: BrokerConfig,
	pool: PgPool,
	router: Arc<Router>,
	listener: Mutex<Option<Listener>>,
	metrics: Arc<Metrics>,
	errors: Arc<ErrorLog>,
	closed: Arc<AtomicBool>,
}

impl Broker {
	/// Connect, run the idempotent schema migration and start the listener
	/// task. `topic` doubles as the resource name.
	pub async fn open(topic: impl Into<String>, config: BrokerConfig) -> Result<Self> {
		let topic = topic.into();
		let pool = PgPoolOptions::new()
			.min_connections(config.min_idle)
			.max_connections(config.max_pool_size)
			.connect(&config.db_url)
			.await?;
		// Simple-protocol execute: the migration is a multi-statement script.
		pool.execute(SCHEMA_SQL).await?;

		let router = Arc::new(Router::new());
		let listener = Listener::spawn(&config.db_url, Arc::clone(&router)).await?;
		log::info!("topic `{}` open (claim timeout {:?})", topic, config.claim_timeout());

		Ok(Self {
			topic,
			metrics: Arc::new(Metrics::new(config.metrics_window_seconds)),
			errors: Arc::new(ErrorLog::default()),
			config,
			pool,
			router,
			listener: Mutex::new(Some(listener)),
			closed: Arc::new(AtomicBool::new(false)),
		})
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn config(&self) -> &BrokerConfig {
		&self.config
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
	}

	pub fn errors(&self) -> &Arc<ErrorLog> {
		&self.errors
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	fn ensure_open(&self) -> Result<()> {
		if self.is_closed() {
			return Err(BrokerError::Closed);
		}
		Ok(())
	}

	/// A write-capability wrapper for `service`. Thread-safe through the
	/// pool; callers should still not share one publisher across threads.
	pub fn publisher(&self, service: &str) -> Result<Publisher> {
		self.ensure_open()?;
		Ok(Publisher::new(
			self.topic.clone(),
			service.to_string(),
			self.pool.clone(),
			Arc::clone(&self.metrics),
			Arc::clone(&self.errors),
			Arc::clone(&self.closed),
		))
	}

	/// A read-capability wrapper: a dedicated connection, a notification
	/// buffer and a consumer-group binding.
	pub async fn subscriber(&self, service: &str, consumer_group: &str) -> Result<Subscriber> {
		self.ensure_open()?;
		let conn = self.pool.acquire().await?;
		Ok(Subscriber::new(
			self.topic.clone(),
			consumer_group.to_string(),
			service.to_string(),
			conn,
			Arc::clone(&self.router),
			&self.config,
			Arc::clone(&self.metrics),
			Arc::clone(&self.errors),
			Arc::clone(&self.closed),
		))
	}

	/// Unacked backlog for a group: published rows the group has not acked
	/// yet, in flight or not.
	pub async fn depth(&self, consumer_group: &str) -> Result<i64> {
		self.ensure_open()?;
		let row = sqlx::query(
			r#"
			SELECT COUNT(*) AS depth
			FROM topic_messages m
			LEFT JOIN topic_acks a
				ON a.topic = m.topic AND a.message_id = m.message_id AND a.consumer_group = $1
			WHERE m.topic = $2 AND a.message_id IS NULL
			"#,
		)
		.bind(consumer_group)
		.bind(&self.topic)
		.fetch_one(&self.pool)
		.await?;
		Ok(row.try_get("depth")?)
	}

	/// Stop the listener, wake every blocked subscriber and close the pool.
	/// Wrappers outlive this only to observe [`BrokerError::Closed`].
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let listener = self.listener.lock().take();
		if let Some(mut listener) = listener {
			listener.kill().await;
		}
		self.router.clear();
		self.pool.close().await;
		log::info!("topic `{}` closed", self.topic);
	}
}
