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

//! IO for the PostgreSQL database the indexers write into. One resource
//! multiplexes capability slices by usage type; every wrapper holds one
//! pooled connection for its lifetime and pins its run's schema.

mod batch;
pub mod env;
pub mod meta;
pub mod strategy;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics};

pub use self::{
	env::EnvWriter,
	meta::{MetaReader, MetaWriter, RUN_METADATA_KEY},
	strategy::{strategy_by_name, BlobPerTick, EnvStorageStrategy, RowPerCell, DEFAULT_STRATEGY},
};
use crate::{
	error::{ArchiveError, Result},
	resource::{Resource, UsageContext, UsageState, UsageType, Wrapped, WrapperSet},
};

#[derive(Clone, Debug, Deserialize)]
pub struct StrategyConfig {
	#[serde(default = "default_strategy_name")]
	pub name: String,
	#[serde(default)]
	pub options: serde_json::Value,
}

fn default_strategy_name() -> String {
	DEFAULT_STRATEGY.to_string()
}

impl Default for StrategyConfig {
	fn default() -> Self {
		Self { name: default_strategy_name(), options: serde_json::Value::Null }
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
	/// PostgreSQL url.
	pub db_url: String,
	#[serde(default = "default_max_pool_size")]
	pub max_pool_size: u32,
	#[serde(default = "default_min_idle")]
	pub min_idle: u32,
	#[serde(default = "default_metrics_window")]
	pub metrics_window_seconds: usize,
	#[serde(default)]
	pub env_strategy: StrategyConfig,
}

const fn default_max_pool_size() -> u32 {
	10
}

const fn default_min_idle() -> u32 {
	1
}

const fn default_metrics_window() -> usize {
	sim_archive_common::metrics::DEFAULT_WINDOW_SECONDS
}

impl DatabaseConfig {
	pub fn new(db_url: impl Into<String>) -> Self {
		Self {
			db_url: db_url.into(),
			max_pool_size: default_max_pool_size(),
			min_idle: default_min_idle(),
			metrics_window_seconds: default_metrics_window(),
			env_strategy: StrategyConfig::default(),
		}
	}
}

pub struct Database {
	name: String,
	pool: PgPool,
	config: DatabaseConfig,
	strategy: Arc<dyn EnvStorageStrategy>,
	metrics: Arc<Metrics>,
	errors: Arc<ErrorLog>,
	state: RwLock<UsageState>,
	wrappers: WrapperSet,
}

impl Database {
	pub async fn connect(name: impl Into<String>, config: DatabaseConfig) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.min_connections(config.min_idle)
			.max_connections(config.max_pool_size)
			.connect(&config.db_url)
			.await?;
		let strategy: Arc<dyn EnvStorageStrategy> =
			strategy_by_name(&config.env_strategy.name, &config.env_strategy.options)?.into();
		Ok(Self {
			name: name.into(),
			pool,
			metrics: Arc::new(Metrics::new(config.metrics_window_seconds)),
			errors: Arc::new(ErrorLog::default()),
			config,
			strategy,
			state: RwLock::new(UsageState::Active),
			wrappers: WrapperSet::new(),
		})
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
	}

	pub fn errors(&self) -> &Arc<ErrorLog> {
		&self.errors
	}

	fn ensure_active(&self) -> Result<()> {
		match *self.state.read() {
			UsageState::Active => Ok(()),
			_ => Err(ArchiveError::Config(format!("database `{}` is closed", self.name))),
		}
	}
}

#[async_trait]
impl Resource for Database {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> &'static str {
		"database"
	}

	fn usage_state(&self, _usage: UsageType) -> UsageState {
		*self.state.read()
	}

	async fn wrap(&self, ctx: &UsageContext) -> Result<Wrapped> {
		self.ensure_active()?;
		let tag = self.wrappers.track(&ctx.service_name, ctx.usage);
		match ctx.usage {
			UsageType::DbMetaRead => {
				let conn = self.pool.acquire().await?;
				Ok(Wrapped::MetaReader(MetaReader::new(conn, tag)))
			}
			UsageType::DbMetaWrite => {
				let conn = self.pool.acquire().await?;
				Ok(Wrapped::MetaWriter(MetaWriter::new(conn, Arc::clone(&self.metrics), Arc::clone(&self.errors), tag)))
			}
			UsageType::DbEnvWrite => {
				let window = match ctx.param("metrics_window_seconds") {
					Some(raw) => raw.parse::<usize>().map_err(|e| {
						ArchiveError::Config(format!("metrics_window_seconds `{}` is not a number: {}", raw, e))
					})?,
					None => self.config.metrics_window_seconds,
				};
				let conn = self.pool.acquire().await?;
				Ok(Wrapped::EnvWriter(EnvWriter::new(
					conn,
					Arc::clone(&self.strategy),
					window,
					Arc::clone(&self.errors),
					tag,
				)))
			}
			usage => Err(ArchiveError::UnknownUsage { resource: self.name.clone(), usage: usage.to_string() }),
		}
	}

	async fn close(&self) {
		*self.state.write() = UsageState::Closed;
		self.wrappers.warn_leaked(&self.name);
		self.pool.close().await;
	}
}
