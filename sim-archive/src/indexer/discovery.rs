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

//! Run discovery and metadata gating. Both poll the blob store on a fixed
//! interval, are interruptible through the service context, and fail the
//! service with a Timeout when their deadline passes.

use std::time::{Duration, Instant};

use sim_archive_common::{RunId, RunMetadata};

use crate::{
	error::{ArchiveError, Result},
	indexer::IndexerConfig,
	service::ServiceContext,
	storage::{metadata_key, StorageError, StorageReader},
};

/// Wait for the first run whose timestamp is after `started_at_ms`.
pub async fn discover_run(
	ctx: &ServiceContext,
	storage: &StorageReader,
	started_at_ms: i64,
	config: &IndexerConfig,
) -> Result<RunId> {
	let deadline = Instant::now() + Duration::from_millis(config.max_poll_duration_ms);
	let interval = Duration::from_millis(config.poll_interval_ms.max(1));
	loop {
		match storage.list_run_ids(started_at_ms) {
			Ok(runs) => {
				if let Some(run) = runs.into_iter().next() {
					log::info!("service `{}` discovered run {}", ctx.name(), run);
					return Ok(run);
				}
			}
			Err(e) => {
				// Transient listing failures are retried until the deadline.
				log::warn!("service `{}` run listing failed: {}", ctx.name(), e);
				ctx.errors().record(e.kind(), "run discovery", e.to_string());
			}
		}
		if Instant::now() + interval > deadline {
			return Err(ArchiveError::Timeout {
				what: format!("discovering a run after {}", started_at_ms),
				waited_ms: config.max_poll_duration_ms,
			});
		}
		ctx.check_pause().await?;
		ctx.sleep(interval).await?;
	}
}

/// Block until the run's `metadata.pb` is readable. The returned metadata is
/// cached by the caller for the run's lifetime and is the only legal source
/// of environment shape, topology and dimension count.
pub async fn await_metadata(
	ctx: &ServiceContext,
	storage: &StorageReader,
	run: &RunId,
	config: &IndexerConfig,
) -> Result<RunMetadata> {
	let deadline = Instant::now() + Duration::from_millis(config.metadata_max_poll_duration_ms);
	let interval = Duration::from_millis(config.metadata_poll_interval_ms.max(1));
	let key = metadata_key(run);
	loop {
		match storage.read_one::<RunMetadata>(&key) {
			Ok(metadata) => {
				log::info!(
					"service `{}` got metadata for {} ({} dimensions, {})",
					ctx.name(),
					run,
					metadata.dimensions.len(),
					metadata.topology
				);
				return Ok(metadata);
			}
			Err(StorageError::NotFound { .. }) => {}
			Err(e @ StorageError::Corrupt { .. }) => return Err(e.into()),
			Err(e) => {
				log::warn!("service `{}` metadata read failed: {}", ctx.name(), e);
				ctx.errors().record(e.kind(), "metadata gating", e.to_string());
			}
		}
		if Instant::now() + interval > deadline {
			return Err(ArchiveError::Timeout {
				what: format!("metadata for run {}", run),
				waited_ms: config.metadata_max_poll_duration_ms,
			});
		}
		ctx.check_pause().await?;
		ctx.sleep(interval).await?;
	}
}
