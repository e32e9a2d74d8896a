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

//! Configuration-driven wiring, end to end: resources and services built
//! from one declarative tree, indexing a seeded run.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_std::task;
use sqlx::{Connection, Row};

use sim_archive::{
	storage::{batch_key, metadata_key},
	BatchInfo, CellRecord, Config, RunId, RunMetadata, Runtime, ServiceState, TickData, UsageContext, UsageType,
};
use test_common::TestGuard;

#[test]
fn runtime_builds_starts_and_indexes_from_config() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let dir = tempfile::tempdir()?;
		let run = RunId::generate();

		// Seed the run before the services come up: metadata plus one batch.
		{
			let store = sim_archive::FileStore::open(
				"blobs",
				sim_archive::StorageConfig { root_directory: dir.path().to_path_buf(), metrics_window_seconds: 60 },
			)?;
			let writer = store.writer();
			let mut blob = writer.open_writer(&metadata_key(&run))?;
			blob.append(&RunMetadata {
				simulation_run_id: run.clone(),
				dimensions: vec![10, 10],
				topology: "torus".into(),
			})?;
			blob.commit()?;
			let mut blob = writer.open_writer(&batch_key(&run, 0, 9))?;
			for tick in 0..10i64 {
				blob.append(&TickData {
					tick,
					cells: vec![CellRecord { position: vec![tick, 0], value: tick, owner: None }],
				})?;
			}
			blob.commit()?;
		}

		let config: Config = serde_json::from_value(serde_json::json!({
			"resources": {
				"batches": {
					"kind": "topic",
					"options": { "db_url": url.as_str(), "recheck_interval_ms": 100 }
				},
				"blobs": {
					"kind": "file-storage",
					"options": { "root_directory": dir.path() }
				},
				"simdb": {
					"kind": "database",
					"options": { "db_url": url.as_str() }
				}
			},
			"services": {
				"env-indexer-1": {
					"kind": "env-indexer",
					"options": {
						"run_id": run.to_string(),
						"insert_batch_size": 4,
						"flush_timeout_ms": 200
					},
					"resources": {
						"topic": "topic-read:batches?consumer_group=env",
						"storage": "storage-read:blobs",
						"db": "db-env-write:simdb?metrics_window_seconds=30"
					}
				}
			}
		}))?;

		let runtime = Runtime::build(config).await?;
		runtime.start_all()?;
		let state = runtime.states()["env-indexer-1"];
		assert!(matches!(state, ServiceState::Starting | ServiceState::Running));

		// Publish the batch notification through the same registry.
		let publisher = runtime
			.registry()
			.wrap("batches", &UsageContext::new("persistence", UsageType::TopicWrite))
			.await?
			.into_publisher()?;
		publisher.set_run(&run)?;
		publisher
			.publish(
				BatchInfo::TYPE_URL,
				&BatchInfo {
					simulation_run_id: run.clone(),
					storage_key: batch_key(&run, 0, 9),
					tick_start: 0,
					tick_end: 9,
					written_at_ms: 1,
				},
			)
			.await?;

		let mut conn = sqlx::postgres::PgConnection::connect(&url).await?;
		let sql = format!("SELECT COUNT(*) AS n FROM \"{}\".env_ticks", run.schema_name());
		let deadline = Instant::now() + Duration::from_secs(15);
		let mut indexed = false;
		while Instant::now() < deadline {
			let n: i64 = match sqlx::query(&sql).fetch_one(&mut conn).await {
				Ok(row) => row.try_get("n")?,
				Err(_) => 0,
			};
			if n == 10 {
				indexed = true;
				break;
			}
			task::sleep(Duration::from_millis(50)).await;
		}
		assert!(indexed, "runtime-wired indexer did not index the batch");

		drop(publisher);
		runtime.shutdown().await;
		Ok(())
	})
}
