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

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::PgPool;

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, Counter, RunId};

use crate::{
	envelope::Envelope,
	error::{BrokerError, Result},
};

/// Write-capability slice of a topic. Publishing is a single auto-committed
/// insert; the prepared statement is reused through the connection's
/// statement cache.
pub struct Publisher {
	topic: String,
	service: String,
	pool: PgPool,
	run: Mutex<Option<RunId>>,
	published: Arc<Counter>,
	errors: Arc<ErrorLog>,
	closed: Arc<AtomicBool>,
}

impl Publisher {
	pub(crate) fn new(
		topic: String,
		service: String,
		pool: PgPool,
		metrics: Arc<Metrics>,
		errors: Arc<ErrorLog>,
		closed: Arc<AtomicBool>,
	) -> Self {
		let published = metrics.counter("messages_published");
		Self { topic, service, pool, run: Mutex::new(None), published, errors, closed }
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn run(&self) -> Option<RunId> {
		self.run.lock().clone()
	}

	/// Bind this publisher to a simulation run. Idempotent for the same run;
	/// rebinding to a different run is a configuration error. Must precede
	/// the first publish.
	pub fn set_run(&self, run: &RunId) -> Result<()> {
		let mut bound = self.run.lock();
		match &*bound {
			Some(existing) if existing == run => Ok(()),
			Some(existing) => {
				Err(BrokerError::RunRebound { bound: existing.to_string(), requested: run.to_string() })
			}
			None => {
				*bound = Some(run.clone());
				Ok(())
			}
		}
	}

	/// Wrap `payload` in an envelope and persist one row. Returns the
	/// generated message id.
	pub async fn publish<T: Serialize>(&self, type_url: &str, payload: &T) -> Result<String> {
		let envelope = Envelope::wrap(type_url, payload)?;
		self.publish_envelope(envelope).await
	}

	/// The raw half of the publish path; useful when the caller built the
	/// envelope itself.
	pub async fn publish_envelope(&self, envelope: Envelope) -> Result<String> {
		if self.closed.load(Ordering::Acquire) {
			return Err(BrokerError::Closed);
		}
		if self.run.lock().is_none() {
			return Err(BrokerError::RunNotSet);
		}
		let bytes = envelope.encode()?;
		let result = sqlx::query(
			"INSERT INTO topic_messages (topic, message_id, ts_ms, envelope) VALUES ($1, $2, $3, $4)",
		)
		.bind(&self.topic)
		.bind(&envelope.message_id)
		.bind(envelope.ts_ms)
		.bind(&bytes)
		.execute(&self.pool)
		.await;

		match result {
			Ok(_) => {
				self.published.inc();
				log::trace!("published {} to `{}` for {}", envelope.message_id, self.topic, self.service);
				Ok(envelope.message_id)
			}
			Err(e) => {
				let err = BrokerError::from(e);
				self.errors.record(err.kind(), format!("topic={}", self.topic), err.to_string());
				Err(err)
			}
		}
	}
}
