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

//! Read-capability slice of a topic: claim-based competing consumption with
//! per-group acknowledgement and stuck-claim recovery.
//!
//! A subscriber is single-threaded over its wrapper. It never busy-polls the
//! database: after a claim miss it parks on its notification buffer, waking
//! on the next insert or after the bounded recheck interval (which is also
//! what picks up stuck messages, since those produce no notification).

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use async_std::future::timeout;
use sqlx::{pool::PoolConnection, postgres::Postgres, Connection, Row};
use uuid::Uuid;

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, Counter, ErrorKind, RunId};

use crate::{
	broker::BrokerConfig,
	envelope::{AnyPayload, Envelope},
	error::{BrokerError, Result},
	listener::Router,
};

/// Claim and read in one atomic statement. `SKIP LOCKED` lets competing
/// subscribers of one group fan out without coordination; the subselect
/// carries the prior claimant out so the caller can tell a fresh claim from a
/// stuck reassignment.
const CLAIM_SQL: &str = r#"
UPDATE topic_messages AS m
	SET claimed_by = $1, claimed_at = NOW()
	FROM (
		SELECT c.id, c.claimed_by AS prior_claim
		FROM topic_messages AS c
		LEFT JOIN topic_acks AS a
			ON a.topic = c.topic AND a.message_id = c.message_id AND a.consumer_group = $2
		WHERE a.message_id IS NULL
			AND c.topic = $3
			AND c.id > $4
			AND (c.claimed_by IS NULL
				OR ($5::float8 > 0 AND c.claimed_at < NOW() - make_interval(secs => $5::float8)))
		ORDER BY c.id
		LIMIT 1
		FOR UPDATE OF c SKIP LOCKED
	) AS picked
	WHERE m.id = picked.id
RETURNING m.id, m.message_id, m.ts_ms, m.envelope, picked.prior_claim
"#;

/// One claimed message. The ack token is the broker row id and is opaque to
/// consumers.
#[derive(Debug, Clone)]
pub struct Delivery {
	pub payload: AnyPayload,
	pub message_id: String,
	pub ts_ms: i64,
	pub consumer_group: String,
	ack_token: i64,
}

impl Delivery {
	pub fn ack_token(&self) -> i64 {
		self.ack_token
	}
}

pub struct Subscriber {
	topic: String,
	consumer_group: String,
	consumer_id: String,
	conn: PoolConnection<Postgres>,
	router: Arc<Router>,
	router_token: u64,
	notifications: flume::Receiver<i64>,
	/// Highest row id this subscriber has claimed. A pagination hint, not a
	/// correctness input.
	last_seen: i64,
	run: Option<RunId>,
	claim_timeout_secs: f64,
	recheck: Duration,
	received: Arc<Counter>,
	acknowledged: Arc<Counter>,
	stuck_reassigned: Arc<Counter>,
	skipped: Arc<Counter>,
	errors: Arc<ErrorLog>,
	closed: Arc<AtomicBool>,
}

impl Subscriber {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		topic: String,
		consumer_group: String,
		service: String,
		conn: PoolConnection<Postgres>,
		router: Arc<Router>,
		config: &BrokerConfig,
		metrics: Arc<Metrics>,
		errors: Arc<ErrorLog>,
		closed: Arc<AtomicBool>,
	) -> Self {
		let (router_token, notifications) = router.register(&topic);
		let consumer_id = format!("{}:{}", service, Uuid::new_v4());
		Self {
			received: metrics.counter("messages_received"),
			acknowledged: metrics.counter("messages_acknowledged"),
			stuck_reassigned: metrics.counter("stuck_messages_reassigned"),
			skipped: metrics.counter("messages_skipped"),
			topic,
			consumer_group,
			consumer_id,
			conn,
			router,
			router_token,
			notifications,
			last_seen: 0,
			run: None,
			claim_timeout_secs: config.claim_timeout().as_secs_f64(),
			recheck: config.recheck_interval(),
			errors,
			closed,
		}
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn consumer_group(&self) -> &str {
		&self.consumer_group
	}

	pub fn consumer_id(&self) -> &str {
		&self.consumer_id
	}

	pub fn run(&self) -> Option<&RunId> {
		self.run.as_ref()
	}

	/// Idempotent run binding, mirroring the publisher side.
	pub fn set_run(&mut self, run: &RunId) -> Result<()> {
		match &self.run {
			Some(existing) if existing == run => Ok(()),
			Some(existing) => {
				Err(BrokerError::RunRebound { bound: existing.to_string(), requested: run.to_string() })
			}
			None => {
				self.run = Some(run.clone());
				Ok(())
			}
		}
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(BrokerError::Closed);
		}
		Ok(())
	}

	/// Block until a message is claimed for this subscriber's group.
	pub async fn receive(&mut self) -> Result<Delivery> {
		loop {
			self.ensure_open()?;
			if let Some(delivery) = self.try_claim().await? {
				return Ok(delivery);
			}
			let wait = self.recheck;
			self.wait_for_notification(wait).await?;
		}
	}

	/// One claim pass with no waiting. Building block for callers that
	/// compose their own wait (e.g. with a shutdown signal); most callers
	/// want [`poll`](Self::poll) or [`receive`](Self::receive).
	pub async fn try_next(&mut self) -> Result<Option<Delivery>> {
		self.ensure_open()?;
		self.try_claim().await
	}

	/// Park on the notification buffer for at most `max`, then return. A
	/// timeout is not an error: the caller re-runs the claim either way,
	/// which is also what picks up stuck messages (those never notify).
	pub async fn wait_notified(&self, max: Duration) -> Result<()> {
		self.wait_for_notification(max).await
	}

	/// Like [`receive`](Self::receive) with a deadline; `None` on timeout.
	pub async fn poll(&mut self, poll_timeout: Duration) -> Result<Option<Delivery>> {
		let deadline = Instant::now() + poll_timeout;
		loop {
			self.ensure_open()?;
			if let Some(delivery) = self.try_claim().await? {
				return Ok(Some(delivery));
			}
			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}
			let wait = self.recheck.min(deadline - now);
			self.wait_for_notification(wait).await?;
		}
	}

	/// Record the ack and release the claim. All three statements commit or
	/// none; a duplicate ack rolls back and reports idempotent success.
	pub async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
		self.ensure_open()?;
		let mut tx = self.conn.begin().await?;

		let row = sqlx::query("SELECT message_id FROM topic_messages WHERE id = $1")
			.bind(delivery.ack_token)
			.fetch_optional(&mut tx)
			.await?;
		let message_id: String = match row {
			Some(row) => row.try_get("message_id")?,
			None => return Err(BrokerError::UnknownAckToken(delivery.ack_token)),
		};

		let inserted = sqlx::query(
			"INSERT INTO topic_acks (topic, consumer_group, message_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
		)
		.bind(&self.topic)
		.bind(&self.consumer_group)
		.bind(&message_id)
		.execute(&mut tx)
		.await?
		.rows_affected();
		if inserted == 0 {
			tx.rollback().await?;
			log::debug!("duplicate ack for {} in group `{}`", message_id, self.consumer_group);
			return Ok(());
		}

		sqlx::query("UPDATE topic_messages SET claimed_by = NULL, claimed_at = NULL WHERE id = $1")
			.bind(delivery.ack_token)
			.execute(&mut tx)
			.await?;
		tx.commit().await?;
		self.acknowledged.inc();
		Ok(())
	}

	/// Manually release a claim without acking, making the row immediately
	/// available again. The operator affordance for wedged messages.
	pub async fn release(&mut self, delivery: &Delivery) -> Result<()> {
		self.ensure_open()?;
		sqlx::query("UPDATE topic_messages SET claimed_by = NULL, claimed_at = NULL WHERE id = $1")
			.bind(delivery.ack_token)
			.execute(&mut self.conn)
			.await?;
		Ok(())
	}

	/// One pass over eligible rows: claim the next row, decode it, and hand
	/// it out. An undecodable envelope is skipped for this subscriber only
	/// (claim kept, no ack) and the pass moves on to the next row.
	async fn try_claim(&mut self) -> Result<Option<Delivery>> {
		loop {
			let row = sqlx::query(CLAIM_SQL)
				.bind(&self.consumer_id)
				.bind(&self.consumer_group)
				.bind(&self.topic)
				.bind(self.last_seen)
				.bind(self.claim_timeout_secs)
				.fetch_optional(&mut self.conn)
				.await?;

			let row = match row {
				Some(row) => row,
				None => return Ok(None),
			};

			let id: i64 = row.try_get("id")?;
			let message_id: String = row.try_get("message_id")?;
			let ts_ms: i64 = row.try_get("ts_ms")?;
			let envelope: Vec<u8> = row.try_get("envelope")?;
			let prior_claim: Option<String> = row.try_get("prior_claim")?;

			self.last_seen = id;

			if let Some(prior) = prior_claim {
				self.stuck_reassigned.inc();
				self.errors.record(
					ErrorKind::Io,
					format!("topic={} message={}", self.topic, message_id),
					format!("stuck claim by `{}` reassigned to `{}`", prior, self.consumer_id),
				);
				log::warn!(
					"topic `{}`: reassigned stuck message {} (was claimed by `{}`)",
					self.topic,
					message_id,
					prior
				);
			}

			match Envelope::decode(&envelope) {
				Ok(envelope) => {
					self.received.inc();
					return Ok(Some(Delivery {
						payload: envelope.payload,
						message_id,
						ts_ms,
						consumer_group: self.consumer_group.clone(),
						ack_token: id,
					}));
				}
				Err(e) => {
					self.skipped.inc();
					self.errors.record(
						ErrorKind::Protocol,
						format!("topic={} message={}", self.topic, message_id),
						e.to_string(),
					);
					log::warn!("topic `{}`: skipping undecodable message {}: {}", self.topic, message_id, e);
					// Claim stays in place; another consumer (or the
					// operator) decides the row's fate.
				}
			}
		}
	}

	async fn wait_for_notification(&self, max: Duration) -> Result<()> {
		match timeout(max, self.notifications.recv_async()).await {
			Ok(Ok(_id)) => {
				// Drain coalesced wake-ups so one claim pass answers them all.
				while self.notifications.try_recv().is_ok() {}
				Ok(())
			}
			Ok(Err(flume::RecvError::Disconnected)) => Err(BrokerError::Closed),
			Err(_elapsed) => Ok(()),
		}
	}
}

impl Drop for Subscriber {
	fn drop(&mut self) {
		self.router.deregister(&self.topic, self.router_token);
	}
}
