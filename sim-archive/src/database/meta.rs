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

//! Metadata capability slices: a per-run key/value table written by the
//! metadata indexer and read back by the query side.

use std::sync::Arc;

use sqlx::{pool::PoolConnection, postgres::Postgres, Connection, Executor, Row};

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, Counter, RunId, RunMetadata};

use crate::{
	error::{ArchiveError, Result},
	resource::WrapperTag,
};

/// Key the full serialised [`RunMetadata`] lives under.
pub const RUN_METADATA_KEY: &str = "run_metadata";

/// Postgres "undefined_table"; a read against a run that was never indexed.
const UNDEFINED_TABLE: &str = "42P01";

/// Create the run's schema if absent and pin this connection's search path to
/// it. Idempotent for the same run; rebinding is a configuration error.
pub(crate) async fn bind_run_schema(
	conn: &mut PoolConnection<Postgres>,
	bound: &mut Option<RunId>,
	run: &RunId,
) -> Result<()> {
	match bound {
		Some(existing) if existing == run => return Ok(()),
		Some(existing) => {
			return Err(ArchiveError::Config(format!("already bound to run {}, refusing rebind to {}", existing, run)))
		}
		None => {}
	}
	let schema = run.schema_name();
	conn.execute(format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema).as_str()).await?;
	conn.execute(format!("SET search_path TO \"{}\"", schema).as_str()).await?;
	*bound = Some(run.clone());
	Ok(())
}

/// `db-meta-write`: idempotent key/value upserts into the run's schema.
pub struct MetaWriter {
	conn: PoolConnection<Postgres>,
	run: Option<RunId>,
	metrics: Arc<Metrics>,
	metadata_written: Arc<Counter>,
	errors: Arc<ErrorLog>,
	_tag: Arc<WrapperTag>,
}

impl MetaWriter {
	pub(crate) fn new(
		conn: PoolConnection<Postgres>,
		metrics: Arc<Metrics>,
		errors: Arc<ErrorLog>,
		tag: Arc<WrapperTag>,
	) -> Self {
		let metadata_written = metrics.counter("metadata_written");
		Self { conn, run: None, metrics, metadata_written, errors, _tag: tag }
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
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

	pub async fn create_metadata_table(&mut self) -> Result<()> {
		self.ensure_run()?;
		sqlx::query("CREATE TABLE IF NOT EXISTS run_metadata (key TEXT PRIMARY KEY, value BYTEA NOT NULL)")
			.execute(&mut self.conn)
			.await?;
		Ok(())
	}

	/// Upsert one record by key. Safe under topic redelivery.
	pub async fn insert_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
		self.ensure_run()?;
		let mut tx = self.conn.begin().await?;
		let result = sqlx::query(
			"INSERT INTO run_metadata (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
		)
		.bind(key)
		.bind(value)
		.execute(&mut tx)
		.await;
		match result {
			Ok(_) => {
				tx.commit().await?;
				self.metadata_written.inc();
				Ok(())
			}
			Err(e) => {
				tx.rollback().await?;
				let err = ArchiveError::from(e);
				self.errors.record(err.kind(), format!("key={}", key), err.to_string());
				Err(err)
			}
		}
	}

	pub async fn write_run_metadata(&mut self, metadata: &RunMetadata) -> Result<()> {
		let bytes = rmp_serde::to_vec(metadata)?;
		self.insert_metadata(RUN_METADATA_KEY, &bytes).await
	}
}

/// `db-meta-read`.
pub struct MetaReader {
	conn: PoolConnection<Postgres>,
	run: Option<RunId>,
	_tag: Arc<WrapperTag>,
}

impl MetaReader {
	pub(crate) fn new(conn: PoolConnection<Postgres>, tag: Arc<WrapperTag>) -> Self {
		Self { conn, run: None, _tag: tag }
	}

	pub async fn set_run(&mut self, run: &RunId) -> Result<()> {
		bind_run_schema(&mut self.conn, &mut self.run, run).await
	}

	/// The run's metadata, or `None` when nothing has been indexed yet.
	pub async fn read_metadata(&mut self) -> Result<Option<RunMetadata>> {
		if self.run.is_none() {
			return Err(ArchiveError::RunNotSet);
		}
		let row = sqlx::query("SELECT value FROM run_metadata WHERE key = $1")
			.bind(RUN_METADATA_KEY)
			.fetch_optional(&mut self.conn)
			.await;
		let row = match row {
			Ok(row) => row,
			Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNDEFINED_TABLE) => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		match row {
			Some(row) => {
				let bytes: Vec<u8> = row.try_get("value")?;
				Ok(Some(rmp_serde::from_slice(&bytes)?))
			}
			None => Ok(None),
		}
	}
}
