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

//! The batch-oriented indexer framework: run discovery, metadata gating,
//! schema preparation, then a buffered receive/flush loop over topic
//! notifications and blob batches.

pub mod batch;
pub mod discovery;
pub mod env;
pub mod metadata;

use serde::Deserialize;

use sim_archive_common::RunId;

pub use self::{
	batch::{BatchIndexer, TickSink},
	env::EnvSink,
	metadata::MetadataSink,
};

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerConfig {
	/// Supplied: used verbatim. Absent: the indexer discovers the first run
	/// that starts after its own start timestamp.
	#[serde(default)]
	pub run_id: Option<RunId>,
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	#[serde(default = "default_max_poll_duration_ms")]
	pub max_poll_duration_ms: u64,
	#[serde(default = "default_poll_interval_ms")]
	pub metadata_poll_interval_ms: u64,
	#[serde(default = "default_max_poll_duration_ms")]
	pub metadata_max_poll_duration_ms: u64,
	#[serde(default = "default_insert_batch_size")]
	pub insert_batch_size: usize,
	#[serde(default = "default_flush_timeout_ms")]
	pub flush_timeout_ms: u64,
}

const fn default_poll_interval_ms() -> u64 {
	200
}

const fn default_max_poll_duration_ms() -> u64 {
	60_000
}

const fn default_insert_batch_size() -> usize {
	1_000
}

const fn default_flush_timeout_ms() -> u64 {
	1_000
}

impl Default for IndexerConfig {
	fn default() -> Self {
		Self {
			run_id: None,
			poll_interval_ms: default_poll_interval_ms(),
			max_poll_duration_ms: default_max_poll_duration_ms(),
			metadata_poll_interval_ms: default_poll_interval_ms(),
			metadata_max_poll_duration_ms: default_max_poll_duration_ms(),
			insert_batch_size: default_insert_batch_size(),
			flush_timeout_ms: default_flush_timeout_ms(),
		}
	}
}
