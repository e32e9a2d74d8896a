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

//! End-to-end broker scenarios against a live Postgres. Every test returns
//! early when `TEST_DATABASE_URL` is unset.

use std::time::Duration;

use anyhow::Result;
use async_std::task;
use sqlx::{Connection, Row};

use sim_archive_common::{BatchInfo, RunId};
use sim_broker::{Broker, BrokerConfig, Delivery, Subscriber};
use test_common::TestGuard;

fn batch_info(run: &RunId, tick_start: i64, tick_end: i64) -> BatchInfo {
	BatchInfo {
		simulation_run_id: run.clone(),
		storage_key: format!("{}/batch_{:019}_{:019}.pb", run, tick_start, tick_end),
		tick_start,
		tick_end,
		written_at_ms: 1,
	}
}

fn config(url: &str) -> BrokerConfig {
	let mut config = BrokerConfig::new(url);
	// Keep waits short so tests converge quickly.
	config.recheck_interval_ms = 100;
	config
}

fn unpack(delivery: &Delivery) -> BatchInfo {
	delivery.payload.unpack(BatchInfo::TYPE_URL).expect("payload should be a BatchInfo")
}

#[test]
fn e1_round_trip() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("e1", config(&url)).await?;
		let run: RunId = "1650000000000-550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
		let info = batch_info(&run, 0, 99);

		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;

		let mut sub = broker.subscriber("indexer", "g").await?;
		let delivery = sub.poll(Duration::from_secs(1)).await?.expect("message should arrive within 1s");
		assert_eq!(unpack(&delivery), info);
		sub.ack(&delivery).await?;

		assert!(sub.poll(Duration::from_millis(100)).await?.is_none());
		assert_eq!(broker.metrics().counter("messages_published").get(), 1);
		assert_eq!(broker.metrics().counter("messages_acknowledged").get(), 1);
		broker.close().await;
		Ok(())
	})
}

#[test]
fn e2_two_groups_each_see_the_message() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("e2", config(&url)).await?;
		let run = RunId::generate();
		let info = batch_info(&run, 0, 9);

		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;

		let mut sub_a = broker.subscriber("svc-a", "a").await?;
		let mut sub_b = broker.subscriber("svc-b", "b").await?;

		let da = sub_a.poll(Duration::from_secs(1)).await?.expect("group a delivery");
		let db = sub_b.poll(Duration::from_secs(1)).await?.expect("group b delivery");
		assert_eq!(unpack(&da), info);
		assert_eq!(unpack(&db), info);

		sub_a.ack(&da).await?;
		sub_b.ack(&db).await?;

		assert!(sub_a.poll(Duration::from_millis(100)).await?.is_none());
		assert!(sub_b.poll(Duration::from_millis(100)).await?.is_none());
		broker.close().await;
		Ok(())
	})
}

#[test]
fn e3_competing_consumers_share_without_duplicates() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("e3", config(&url)).await?;
		let run = RunId::generate();
		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		for i in 0..10 {
			publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, i, i)).await?;
		}

		let mut handles = Vec::new();
		for n in 0..3 {
			let mut sub: Subscriber = broker.subscriber(&format!("worker-{}", n), "g").await?;
			handles.push(task::spawn(async move {
				let mut seen = Vec::new();
				while let Ok(Some(delivery)) = sub.poll(Duration::from_millis(500)).await {
					let info: BatchInfo = delivery.payload.unpack(BatchInfo::TYPE_URL).unwrap();
					sub.ack(&delivery).await.unwrap();
					seen.push(info.tick_start);
				}
				seen
			}));
		}

		let mut all: Vec<i64> = Vec::new();
		let mut total = 0usize;
		for handle in handles {
			let seen = handle.await;
			total += seen.len();
			all.extend(seen);
		}
		all.sort_unstable();
		assert_eq!(total, 10);
		assert_eq!(all, (0..10).collect::<Vec<i64>>());
		broker.close().await;
		Ok(())
	})
}

#[test]
fn e4_stuck_claim_is_reassigned_within_the_group() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let mut cfg = config(&url);
		cfg.claim_timeout_seconds = 2;
		let broker = Broker::open("e4", cfg).await?;
		let run = RunId::generate();
		let info = batch_info(&run, 0, 0);

		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &info).await?;

		let mut s1 = broker.subscriber("crashy", "g").await?;
		let d1 = s1.poll(Duration::from_secs(1)).await?.expect("first delivery");
		// s1 never acks; let the claim go stale.
		task::sleep(Duration::from_millis(2_500)).await;

		let mut s2 = broker.subscriber("healthy", "g").await?;
		let d2 = s2.poll(Duration::from_secs(1)).await?.expect("reassigned delivery");
		assert_eq!(d2.message_id, d1.message_id);
		s2.ack(&d2).await?;

		assert_eq!(broker.metrics().counter("stuck_messages_reassigned").get(), 1);
		assert!(broker.errors().recent().iter().any(|e| e.message.contains("stuck claim")));
		broker.close().await;
		Ok(())
	})
}

#[test]
fn ack_is_idempotent_and_single_rowed() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("ack-idem", config(&url)).await?;
		let run = RunId::generate();
		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, 0, 0)).await?;

		let mut sub = broker.subscriber("indexer", "g").await?;
		let delivery = sub.poll(Duration::from_secs(1)).await?.unwrap();
		sub.ack(&delivery).await?;
		sub.ack(&delivery).await?;

		let mut conn = sqlx::postgres::PgConnection::connect(&url).await?;
		let acks: i64 = sqlx::query("SELECT COUNT(*) AS n FROM topic_acks WHERE message_id = $1")
			.bind(&delivery.message_id)
			.fetch_one(&mut conn)
			.await?
			.try_get("n")?;
		assert_eq!(acks, 1);
		let claimed: Option<String> =
			sqlx::query("SELECT claimed_by FROM topic_messages WHERE message_id = $1 AND topic = 'ack-idem'")
				.bind(&delivery.message_id)
				.fetch_one(&mut conn)
				.await?
				.try_get("claimed_by")?;
		assert_eq!(claimed, None);
		broker.close().await;
		Ok(())
	})
}

#[test]
fn delivery_ids_are_strictly_increasing_per_subscriber() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("monotone", config(&url)).await?;
		let run = RunId::generate();
		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		for i in 0..5 {
			publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, i, i)).await?;
		}

		let mut sub = broker.subscriber("indexer", "g").await?;
		let mut last_token = 0i64;
		for i in 0..5 {
			let delivery = sub.poll(Duration::from_secs(1)).await?.expect("delivery");
			assert!(delivery.ack_token() > last_token, "row ids must be strictly increasing");
			last_token = delivery.ack_token();
			assert_eq!(unpack(&delivery).tick_start, i);
			sub.ack(&delivery).await?;
		}
		broker.close().await;
		Ok(())
	})
}

#[test]
fn late_joining_group_observes_the_full_tail() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("late-join", config(&url)).await?;
		let run = RunId::generate();
		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		for i in 0..3 {
			publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, i, i)).await?;
		}

		// Group `first` drains and acks everything.
		let mut first = broker.subscriber("early", "first").await?;
		for _ in 0..3 {
			let delivery = first.poll(Duration::from_secs(1)).await?.unwrap();
			first.ack(&delivery).await?;
		}

		// A group joining only now still sees the whole history: rows are
		// never deleted and acks are per group.
		let mut second = broker.subscriber("late", "second").await?;
		let mut seen = Vec::new();
		while let Some(delivery) = second.poll(Duration::from_millis(300)).await? {
			seen.push(unpack(&delivery).tick_start);
			second.ack(&delivery).await?;
		}
		assert_eq!(seen, vec![0, 1, 2]);
		broker.close().await;
		Ok(())
	})
}

#[test]
fn released_claim_is_immediately_available_again() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		// No claim timeout: without the manual release the row would stay
		// in flight forever.
		let broker = Broker::open("release", config(&url)).await?;
		let run = RunId::generate();
		let publisher = broker.publisher("producer")?;
		publisher.set_run(&run)?;
		publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, 0, 0)).await?;

		let mut s1 = broker.subscriber("wedged", "g").await?;
		let d1 = s1.poll(Duration::from_secs(1)).await?.unwrap();

		let mut s2 = broker.subscriber("fresh", "g").await?;
		assert!(s2.poll(Duration::from_millis(200)).await?.is_none(), "claimed row must stay in flight");

		s1.release(&d1).await?;
		let d2 = s2.poll(Duration::from_secs(1)).await?.expect("released row should be claimable");
		assert_eq!(d2.message_id, d1.message_id);
		s2.ack(&d2).await?;
		broker.close().await;
		Ok(())
	})
}

#[test]
fn publish_requires_a_bound_run() -> Result<()> {
	let url = match test_common::database_url() {
		Some(url) => url,
		None => return Ok(()),
	};
	let _guard = TestGuard::lock();
	task::block_on(async {
		let broker = Broker::open("no-run", config(&url)).await?;
		let publisher = broker.publisher("producer")?;
		let run = RunId::generate();
		let err = publisher.publish(BatchInfo::TYPE_URL, &batch_info(&run, 0, 0)).await.unwrap_err();
		assert!(matches!(err, sim_broker::BrokerError::RunNotSet));
		broker.close().await;
		Ok(())
	})
}
