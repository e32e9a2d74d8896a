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

//! Pluggable env-table layout and write logic, selected by name from
//! configuration.
//!
//! The default `blob-per-tick` strategy stores one row per tick with the
//! serialised cell list as a single blob: storage scales with ticks rather
//! than ticks x cells, reads must deserialise a whole tick. `row-per-cell`
//! keeps cells individually addressable at roughly three orders of magnitude
//! more rows.

use async_trait::async_trait;
use sqlx::postgres::PgConnection;

use sim_archive_common::TickData;

use crate::{
	database::batch::Batch,
	error::{ArchiveError, Result},
};

pub const DEFAULT_STRATEGY: &str = "blob-per-tick";

/// Every write statement an implementation issues must be an idempotent
/// upsert keyed on natural identifiers, so redelivered batches merge cleanly.
#[async_trait]
pub trait EnvStorageStrategy: Send + Sync {
	fn name(&self) -> &'static str;

	/// Create this strategy's tables in the connection's current schema.
	/// Idempotent.
	async fn create_tables(&self, conn: &mut PgConnection, dimensions: &[i64]) -> Result<()>;

	/// Upsert a batch of ticks. One statement chain, no commit: the calling
	/// wrapper owns the transaction.
	async fn write_ticks(&self, conn: &mut PgConnection, ticks: &[TickData]) -> Result<u64>;
}

/// Build a strategy from its configured name.
pub fn strategy_by_name(name: &str, _options: &serde_json::Value) -> Result<Box<dyn EnvStorageStrategy>> {
	match name {
		DEFAULT_STRATEGY => Ok(Box::new(BlobPerTick)),
		"row-per-cell" => Ok(Box::new(RowPerCell)),
		other => Err(ArchiveError::Config(format!("unknown env storage strategy `{}`", other))),
	}
}

pub struct BlobPerTick;

#[async_trait]
impl EnvStorageStrategy for BlobPerTick {
	fn name(&self) -> &'static str {
		DEFAULT_STRATEGY
	}

	async fn create_tables(&self, conn: &mut PgConnection, _dimensions: &[i64]) -> Result<()> {
		sqlx::query("CREATE TABLE IF NOT EXISTS env_ticks (tick BIGINT PRIMARY KEY, cells BYTEA NOT NULL)")
			.execute(conn)
			.await?;
		Ok(())
	}

	async fn write_ticks(&self, conn: &mut PgConnection, ticks: &[TickData]) -> Result<u64> {
		let mut batch = Batch::new(
			"env_ticks",
			r#"
			INSERT INTO "env_ticks" (
				tick, cells
			) VALUES
			"#,
			r#"
			ON CONFLICT (tick) DO UPDATE SET
				cells = EXCLUDED.cells
			"#,
		);
		for tick in ticks {
			batch.reserve(2)?;
			if batch.current_num_arguments() > 0 {
				batch.append(",");
			}
			let cells = rmp_serde::to_vec(&tick.cells)?;
			batch.append("(");
			batch.bind(tick.tick)?;
			batch.append(",");
			batch.bind(cells)?;
			batch.append(")");
		}
		batch.execute(conn).await
	}
}

pub struct RowPerCell;

#[async_trait]
impl EnvStorageStrategy for RowPerCell {
	fn name(&self) -> &'static str {
		"row-per-cell"
	}

	async fn create_tables(&self, conn: &mut PgConnection, _dimensions: &[i64]) -> Result<()> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS env_cells (
				tick BIGINT NOT NULL,
				position BYTEA NOT NULL,
				value BIGINT NOT NULL,
				owner BIGINT,
				PRIMARY KEY (tick, position)
			)",
		)
		.execute(conn)
		.await?;
		Ok(())
	}

	async fn write_ticks(&self, conn: &mut PgConnection, ticks: &[TickData]) -> Result<u64> {
		let mut batch = Batch::new(
			"env_cells",
			r#"
			INSERT INTO "env_cells" (
				tick, position, value, owner
			) VALUES
			"#,
			r#"
			ON CONFLICT (tick, position) DO UPDATE SET
				value = EXCLUDED.value,
				owner = EXCLUDED.owner
			"#,
		);
		for tick in ticks {
			for cell in &tick.cells {
				batch.reserve(4)?;
				if batch.current_num_arguments() > 0 {
					batch.append(",");
				}
				let position = rmp_serde::to_vec(&cell.position)?;
				batch.append("(");
				batch.bind(tick.tick)?;
				batch.append(",");
				batch.bind(position)?;
				batch.append(",");
				batch.bind(cell.value)?;
				batch.append(",");
				batch.bind(cell.owner)?;
				batch.append(")");
			}
		}
		batch.execute(conn).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_strategy_resolves() {
		assert_eq!(strategy_by_name(DEFAULT_STRATEGY, &serde_json::Value::Null).unwrap().name(), "blob-per-tick");
		assert_eq!(strategy_by_name("row-per-cell", &serde_json::Value::Null).unwrap().name(), "row-per-cell");
	}

	#[test]
	fn unknown_strategy_is_a_config_error() {
		let err = match strategy_by_name("region-based", &serde_json::Value::Null) {
			Ok(_) => panic!("expected an error"),
			Err(e) => e,
		};
		assert!(matches!(err, ArchiveError::Config(_)));
	}
}
