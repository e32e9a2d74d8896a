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

//! Indexer pipeline scenarios against a live Postgres plus a tempdir blob
//! store. Every test returns early when `TEST_DATABASE_URL` is unset.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_std::task;
use sqlx::{Connection, Row};

use sim_archive::{
	indexer::IndexerConfig,
	storage::{batch_key, metadata_key},
	ArchiveError, BatchInfo, BrokerConfig, Database, DatabaseConfig, EnvSink, FileStore, Resource, RunId, RunMetadata,
	Service, ServiceState, StorageConfig, TickData, TopicResource, UsageContext, UsageType,
};
use sim_archive::{BatchIndexer, CellRecord};
use test_common::TestGuard;

fn storage_config(dir: &tempfile::TempDir) -> StorageConfig {
	StorageConfig { root_directory: dir.path().to_path_buf(), metrics_window_seconds: 60 }
}

fn broker_config(url: &str) -> BrokerConfig {
	let mut config = BrokerConfig::new(url);
	config.recheck_interval_ms = 100;
	config
}

fn indexer_config(run_id: Option<RunId>) -> IndexerConfig {
	let mut config = IndexerConfig::default();
	config.run_id = run_id;
	config.poll_interval_ms = 50;
	config.max_poll_duration_ms = 15_000;
	config.metadata_poll_interval_ms = 50;
	config.metadata_max_poll_duration_ms = 15_000;
	config.insert_batch_size = 10;
	config.flush_timeout_ms = 200;
	config
}

fn ticks(range: std::ops::RangeInclusive<i64>) -> Vec<TickData> {
	range
		.map(|tick| TickData {
			tick,
			cells: vec![CellRecord { position: vec![tick % 10, tick / 10], value: tick, owner: Some(1) }],
		})
		.collect()
}

/// Lay a run down in the blob store: metadata plus one committed batch.
fn seed_run(store: &FileStore, run: &RunId, tick_data: &[TickData]) -> Result<BatchInfo> {
	let writer = store.writer();
	let mut blob = writer.open_writer(&metadata_key(run))?;
	blob.append(&RunMetadata { simulation_run_id: run.clone(), dimensions: vec![10, 10], topology: "torus".into() })?;
	blob.commit()?;

	let (start, end) = (tick_data[0].tick, tick_data[tick_data.len() - 1].tick);
	let key = batch_key(run, start, end);
	let mut blob = writer.open_writer(&key)?;
	for tick in tick_data {
		blob.append(tick)?;
	}
	blob.commit()?;
	Ok(BatchInfo {
		simulation_run_id: run.clone(),
		storage_key: key,
		tick_start: start,
		tick_end: end,
		written_at_ms: 1,
	})
}

async fn env_tick_count(url: &str, run: &RunId) -> Result<i64> {
	let mut conn = sqlx::postgres::PgConnection::connect(url).await?;
	let sql = format!("SELECT COUNT(*) AS n FROM \"{}\".env_ticks", run.schema_name());
	let row = sqlx::query(&sql).fetch_one(&mut conn).await?;
	Ok(row.try_get("n")?)
}

async fn wait_until<F>(deadline: Duration, mut check: F) -> bool
where
	F: FnMut() -> bool,
{
	let until = Instant::now() + deadline;
	while Instant::now() < until {
		if check() {
			return true;
		}
		task::sleep(Duration::from_millis(50)).await;
	}
	false
}

async fn wait_for_tick_count(url: &str, run: &RunId, expected: i64, deadline: Duration) -> bool {
	let until = Instant::now() + deadline;
	while Instant::now() < until {
		if env_tick_count(url, run).await.unwrap_or(-1) == expected {
			return true;
		}
		task::sleep(Duration::from_millis(50)).await;
	}
	false
}

async fn wait_for_drained(topic: &TopicResource, group: &str, deadline: Duration) -> bool {
	let until = Instant::now() + deadline;
	while Instant::now() < until {
		if topic.broker().depth(group).await.unwrap_or(1) == 0 {
			return true;
		}
		task::sleep(Duration::from_millis(50)).await;
	}
	false
}

async fn build_env_indexer(
	topic: &TopicResource,
	store: &FileStore,
	database: &Database,
	config: IndexerConfig,
) -> Result<Service, ArchiveError> {
	let subscriber = topic
		.wrap(&UsageContext::new("env-indexer", UsageType::TopicRead).with_param("consumer_group", "env"))
		.await?
		.into_subscriber()?;
	let storage = store.wrap(&UsageContext::new("env-indexer", UsageType::StorageRead)).await?.into_storage_reader()?;
	let env = database.wrap(&UsageContext::new("env-indexer", UsageType::DbEnvWrite)).await?.into_env_writer()?;
	Ok(Service::new("env-indexer", Box::new(BatchIndexer::new(subscriber, storage, EnvSink::new(env), config))))
}

#[test]
fn e5_discovers_run_prepares_schema_and_indexes() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let dir = tempfile::tempdir()?;
		let store = FileStore::open("blobs", storage_config(&dir))?;
		let topic = TopicResource::open("batches", broker_config(&url)).await?;
		let database = Database::connect("simdb", DatabaseConfig::new(&url)).await?;

		// No run id configured: the indexer must discover the run we create
		// shortly after it starts.
		let service = build_env_indexer(&topic, &store, &database, indexer_config(None)).await?;
		service.start()?;
		task::sleep(Duration::from_millis(200)).await;

		let run = RunId::generate();
		let tick_data = ticks(0..=99);
		let info = seed_run(&store, &run, &tick_data)?;

		let publisher = topic.broker().publisher("persistence")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;

		// Schema created, ticks merged, delivery acked.
		assert!(wait_for_tick_count(&url, &run, 100, Duration::from_secs(15)).await, "ticks were not indexed in time");
		assert!(wait_for_drained(&topic, "env", Duration::from_secs(5)).await, "delivery was not acked");

		service.stop()?;
		assert_eq!(service.state(), ServiceState::Stopped);

		// E6: simulated redelivery of the same batch. The MERGE keeps the
		// database byte-identical; no duplicate rows appear.
		let service = build_env_indexer(&topic, &store, &database, indexer_config(Some(run.clone()))).await?;
		service.start()?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;
		assert!(wait_for_drained(&topic, "env", Duration::from_secs(15)).await, "redelivery was not acked");
		assert_eq!(env_tick_count(&url, &run).await?, 100);

		service.stop()?;
		topic.close().await;
		database.close().await;
		Ok(())
	})
}

#[test]
fn final_flush_runs_on_stop() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let dir = tempfile::tempdir()?;
		let store = FileStore::open("blobs", storage_config(&dir))?;
		let topic = TopicResource::open("batches", broker_config(&url)).await?;
		let database = Database::connect("simdb", DatabaseConfig::new(&url)).await?;

		let run = RunId::generate();
		let tick_data = ticks(0..=4);
		let info = seed_run(&store, &run, &tick_data)?;

		// Flush edges pushed out of reach: nothing gets written until the
		// guaranteed final flush on stop.
		let mut config = indexer_config(Some(run.clone()));
		config.insert_batch_size = 1_000_000;
		config.flush_timeout_ms = 600_000;
		let service = build_env_indexer(&topic, &store, &database, config).await?;
		service.start()?;

		let publisher = topic.broker().publisher("persistence")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;

		let ingested = wait_until(Duration::from_secs(10), || {
			service.metrics().counter("batches_received").get() == 1
		})
		.await;
		assert!(ingested, "delivery was not ingested");
		// Buffered, not flushed.
		let buffered = match env_tick_count(&url, &run).await {
			Ok(n) => n == 0,
			Err(_) => true,
		};
		assert!(buffered, "ticks must not reach the database before the final flush");

		service.stop()?;
		assert_eq!(service.state(), ServiceState::Stopped);
		assert_eq!(env_tick_count(&url, &run).await?, 5);
		assert_eq!(topic.broker().depth("env").await?, 0);

		topic.close().await;
		database.close().await;
		Ok(())
	})
}

#[test]
fn env_writes_are_merge_idempotent() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let database = Database::connect("simdb", DatabaseConfig::new(&url)).await?;
		let run = RunId::generate();
		let mut env =
			database.wrap(&UsageContext::new("test", UsageType::DbEnvWrite)).await?.into_env_writer()?;
		env.set_run(&run).await?;
		env.create_env_table(&[10, 10]).await?;

		let tick_data = ticks(0..=9);
		env.write_ticks(&tick_data).await?;
		let first = env_tick_count(&url, &run).await?;
		env.write_ticks(&tick_data).await?;
		let second = env_tick_count(&url, &run).await?;
		assert_eq!(first, 10);
		assert_eq!(second, first);
		assert_eq!(env.metrics().counter("batches_written").get(), 2);

		database.close().await;
		Ok(())
	})
}

#[test]
fn metadata_round_trips_through_the_database() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let database = Database::connect("simdb", DatabaseConfig::new(&url)).await?;
		let run = RunId::generate();
		let metadata =
			RunMetadata { simulation_run_id: run.clone(), dimensions: vec![4, 4, 4], topology: "bounded".into() };

		let mut writer = database.wrap(&UsageContext::new("meta", UsageType::DbMetaWrite)).await?.into_meta_writer()?;
		writer.set_run(&run).await?;
		writer.create_metadata_table().await?;
		writer.write_run_metadata(&metadata).await?;
		// Idempotent upsert.
		writer.write_run_metadata(&metadata).await?;

		let mut reader = database.wrap(&UsageContext::new("api", UsageType::DbMetaRead)).await?.into_meta_reader()?;
		reader.set_run(&run).await?;
		assert_eq!(reader.read_metadata().await?, Some(metadata));

		// A run nobody indexed reads as absent, not as an error.
		let mut reader = database.wrap(&UsageContext::new("api", UsageType::DbMetaRead)).await?.into_meta_reader()?;
		reader.set_run(&RunId::generate()).await?;
		assert_eq!(reader.read_metadata().await?, None);

		database.close().await;
		Ok(())
	})
}

#[test]
fn database_rejects_foreign_usage() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let database = Database::connect("simdb", DatabaseConfig::new(&url)).await?;
		let err = match database.wrap(&UsageContext::new("svc", UsageType::TopicRead)).await {
			Ok(_) => panic!("expected an error"),
			Err(e) => e,
		};
		assert!(matches!(err, ArchiveError::UnknownUsage { .. }));
		database.close().await;
		Ok(())
	})
}
