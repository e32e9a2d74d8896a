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

//! `db-env-write`: batched, idempotent environment writes through the
//! configured storage strategy. One batch, one commit; a failure rolls the
//! connection back before it is reused.

use std::{sync::Arc, time::Instant};

use sqlx::{pool::PoolConnection, postgres::Postgres, Connection};

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, Counter, RunId, SlidingHistogram, SlidingRate, TickData};

use crate::{
	database::{meta::bind_run_schema, strategy::EnvStorageStrategy},
	error::{ArchiveError, Result},
	resource::WrapperTag,
};

pub struct EnvWriter {
	conn: PoolConnection<Postgres>,
	run: Option<RunId>,
	strategy: Arc<dyn EnvStorageStrategy>,
	metrics: Arc<Metrics>,
	ticks_written: Arc<Counter>,
	ticks_rate: Arc<SlidingRate>,
	batches_written: Arc<Counter>,
	write_latency: Arc<SlidingHistogram>,
	errors: Arc<ErrorLog>,
	_tag: Arc<WrapperTag>,
}

impl EnvWriter {
	pub(crate) fn new(
		conn: PoolConnection<Postgres>,
		strategy: Arc<dyn EnvStorageStrategy>,
		metrics_window_seconds: usize,
		errors: Arc<ErrorLog>,
		tag: Arc<WrapperTag>,
	) -> Self {
		// The metrics window is per wrapper so a service can narrow it via
		// its resource URI without affecting other consumers.
		let metrics = Arc::new(Metrics::new(metrics_window_seconds));
		Self {
			ticks_written: metrics.counter("ticks_written"),
			ticks_rate: metrics.rate("tick_write"),
			batches_written: metrics.counter("batches_written"),
			write_latency: metrics.histogram("write_latency"),
			conn,
			run: None,
			strategy,
			metrics,
			errors,
			_tag: tag,
		}
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
	}

	pub fn strategy_name(&self) -> &'static str {
		self.strategy.name()
	}

	pub fn run(&self) -> Option<&RunId> {
		self.run.as_ref()
	}

	pub async fn set_run(&mut self, run: &RunId) -> Result<()> {
		bind_run_schema(&mut self.conn, &mut self.run, run).await
	}

	fn ensure_run(&self) -> Result<()> {
		if self.run.is_none() {
			return Err(ArchiveError::RunNotSet);
		}
		Ok(())
	}

	/// Create the strategy's tables in the run schema. Idempotent.
	pub async fn create_env_table(&mut self, dimensions: &[i64]) -> Result<()> {
		self.ensure_run()?;
		let mut tx = self.conn.begin().await?;
		match self.strategy.create_tables(&mut *tx, dimensions).await {
			Ok(()) => {
				tx.commit().await?;
				Ok(())
			}
			Err(e) => {
				tx.rollback().await?;
				Err(e)
			}
		}
	}

	/// Upsert a batch of ticks: one statement chain, one commit. Running the
	/// same batch twice leaves the tables byte-identical.
	pub async fn write_ticks(&mut self, ticks: &[TickData]) -> Result<u64> {
		self.ensure_run()?;
		if ticks.is_empty() {
			return Ok(0);
		}
		let started = Instant::now();
		let mut tx = self.conn.begin().await?;
		match self.strategy.write_ticks(&mut *tx, ticks).await {
			Ok(rows) => {
				tx.commit().await?;
				self.ticks_written.add(ticks.len() as u64);
				self.ticks_rate.record(ticks.len() as u64);
				self.batches_written.inc();
				self.write_latency.record(started.elapsed());
				log::debug!(
					"wrote {} ticks ({} rows) via `{}` in {:?}",
					ticks.len(),
					rows,
					self.strategy.name(),
					started.elapsed()
				);
				Ok(rows)
			}
			Err(e) => {
				tx.rollback().await?;
				self.errors.record(e.kind(), format!("ticks={}", ticks.len()), e.to_string());
				Err(e)
			}
		}
	}
}
