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

//! Minimal end-to-end wiring: one topic, one blob store, one database, one
//! env indexer, driven by a tiny in-process producer.
//!
//! Requires a running Postgres:
//! `DATABASE_URL=postgres://localhost/sim cargo run --example simple`

use std::time::Duration;

use sim_archive::{
	storage::{batch_key, metadata_key},
	BatchInfo, CellRecord, Config, FileStore, RunId, RunMetadata, Runtime, StorageConfig, TickData, UsageContext,
	UsageType,
};

fn main() -> anyhow::Result<()> {
	sim_archive::logger::init(log::LevelFilter::Info, log::LevelFilter::Debug)?;
	let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a Postgres instance");
	let blob_root = tempfile::tempdir()?;

	async_std::task::block_on(async {
		let run = RunId::generate();

		// What the persistence service would normally do: commit the run's
		// metadata and one batch of ticks to the blob store.
		{
			let store = FileStore::open(
				"blobs",
				StorageConfig { root_directory: blob_root.path().to_path_buf(), metrics_window_seconds: 60 },
			)?;
			let writer = store.writer();
			let mut blob = writer.open_writer(&metadata_key(&run))?;
			blob.append(&RunMetadata {
				simulation_run_id: run.clone(),
				dimensions: vec![100, 100],
				topology: "torus".into(),
			})?;
			blob.commit()?;

			let mut blob = writer.open_writer(&batch_key(&run, 0, 99))?;
			for tick in 0..100i64 {
				blob.append(&TickData {
					tick,
					cells: vec![CellRecord { position: vec![tick % 100, tick / 100], value: tick, owner: None }],
				})?;
			}
			blob.commit()?;
		}

		let config: Config = serde_json::from_value(serde_json::json!({
			"resources": {
				"batches": { "kind": "topic", "options": { "db_url": db_url.as_str() } },
				"blobs": { "kind": "file-storage", "options": { "root_directory": blob_root.path() } },
				"simdb": { "kind": "database", "options": { "db_url": db_url.as_str() } }
			},
			"services": {
				"env-indexer": {
					"kind": "env-indexer",
					"options": { "run_id": run.to_string() },
					"resources": {
						"topic": "topic-read:batches?consumer_group=env",
						"storage": "storage-read:blobs",
						"db": "db-env-write:simdb"
					}
				}
			}
		}))?;

		let runtime = Runtime::build(config).await?;
		runtime.start_all()?;

		let publisher = runtime
			.registry()
			.wrap("batches", &UsageContext::new("producer", UsageType::TopicWrite))
			.await?
			.into_publisher()?;
		publisher.set_run(&run)?;
		publisher
			.publish(
				BatchInfo::TYPE_URL,
				&BatchInfo {
					simulation_run_id: run.clone(),
					storage_key: batch_key(&run, 0, 99),
					tick_start: 0,
					tick_end: 99,
					written_at_ms: run.timestamp_ms(),
				},
			)
			.await?;

		async_std::task::sleep(Duration::from_secs(3)).await;
		if let Some(service) = runtime.service("env-indexer") {
			log::info!("indexer state: {}", service.state());
			for (name, value) in service.metrics().snapshot() {
				log::info!("  {} = {:?}", name, value);
			}
		}

		drop(publisher);
		runtime.shutdown().await;
		Ok(())
	})
}
