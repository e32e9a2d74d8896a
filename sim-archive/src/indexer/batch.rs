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

//! The generic batch loop. A [`TickSink`] supplies payload typing, schema
//! preparation and the idempotent flush; the loop owns buffering, ack
//! staging, failure policy and the guaranteed final flush.

use std::{
	collections::VecDeque,
	time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use sim_archive_common::{util::now_ms, ErrorKind, RunId, RunMetadata};
use sim_broker::{BrokerError, Delivery};

use crate::{
	error::{ArchiveError, Result},
	indexer::{
		discovery::{await_metadata, discover_run},
		IndexerConfig,
	},
	service::{ServiceContext, Worker},
	storage::StorageReader,
	topic::TopicSubscriber,
};

/// What a concrete indexer plugs into the batch loop.
#[async_trait]
pub trait TickSink: Send + 'static {
	/// Topic payload announcing one blob (`BatchInfo`, `MetadataInfo`, ...).
	type Notice: DeserializeOwned + Send;
	/// Record type inside the announced blob.
	type Record: DeserializeOwned + Send + 'static;

	const NOTICE_TYPE_URL: &'static str;

	fn storage_key(notice: &Self::Notice) -> &str;
	fn notice_run(notice: &Self::Notice) -> &RunId;

	/// Whether the loop must block on run metadata before preparing.
	fn needs_metadata(&self) -> bool;

	/// Bind the run on every schema-aware wrapper this sink holds and create
	/// its tables. Idempotent.
	async fn prepare(&mut self, run: &RunId, metadata: Option<&RunMetadata>) -> Result<()>;

	/// Write a buffer of records. Must be idempotent (database-level MERGE);
	/// the loop may hand the same records over again after a failure.
	async fn flush(&mut self, records: &[Self::Record]) -> Result<u64>;
}

/// Drives one subscriber, one blob-store reader and one sink. Competing
/// instances sharing a consumer group split the work through the broker's
/// claim statement; no further coordination exists.
pub struct BatchIndexer<S: TickSink> {
	subscriber: TopicSubscriber,
	storage: StorageReader,
	sink: S,
	config: IndexerConfig,
	buffer: Vec<S::Record>,
	pending_acks: VecDeque<Delivery>,
}

impl<S: TickSink> BatchIndexer<S> {
	pub fn new(subscriber: TopicSubscriber, storage: StorageReader, sink: S, config: IndexerConfig) -> Self {
		Self { subscriber, storage, sink, config, buffer: Vec::new(), pending_acks: VecDeque::new() }
	}

	/// Flush buffered records, then ack staged deliveries in receive order.
	/// On failure everything is retained for the next flush edge; the MERGE
	/// makes the retry safe.
	async fn flush_and_ack(&mut self, ctx: &ServiceContext) -> Result<()> {
		if !self.buffer.is_empty() {
			let rows = self.sink.flush(&self.buffer).await?;
			ctx.metrics().counter("records_flushed").add(self.buffer.len() as u64);
			log::debug!("service `{}` flushed {} records ({} rows)", ctx.name(), self.buffer.len(), rows);
		}
		while let Some(delivery) = self.pending_acks.front() {
			self.subscriber.ack(delivery).await?;
			self.pending_acks.pop_front();
		}
		self.buffer.clear();
		Ok(())
	}

	/// Read the announced blob and stage its records plus the ack.
	async fn ingest(&mut self, ctx: &ServiceContext, delivery: Delivery) -> Result<()> {
		let notice: S::Notice = delivery
			.payload
			.unpack(S::NOTICE_TYPE_URL)
			.map_err(ArchiveError::from)?;
		let expected_run = self.subscriber.run().cloned();
		if let Some(run) = &expected_run {
			if S::notice_run(&notice) != run {
				// Not ours; leave it unacked for whoever owns that run.
				log::warn!(
					"service `{}` ignoring notice for foreign run {}",
					ctx.name(),
					S::notice_run(&notice)
				);
				return Ok(());
			}
		}
		let key = S::storage_key(&notice);
		let records: Vec<S::Record> = self.storage.open_reader(key)?.collect::<Result<_, _>>()?;
		ctx.metrics().counter("batches_received").inc();
		self.buffer.extend(records);
		self.pending_acks.push_back(delivery);
		Ok(())
	}

	async fn main_loop(&mut self, ctx: &ServiceContext) -> Result<()> {
		let flush_timeout = Duration::from_millis(self.config.flush_timeout_ms.max(1));
		let mut last_flush = Instant::now();
		loop {
			if ctx.stopping() {
				return Ok(());
			}
			ctx.check_pause().await?;

			// One claim pass, then an interruptible park on the notification
			// buffer. Claims and acks always run to completion so the
			// dedicated connection never sees a cancelled statement.
			match self.subscriber.try_next().await {
				Ok(Some(delivery)) => {
					if let Err(e) = self.ingest(ctx, delivery).await {
						// Protocol or storage trouble: skip without acking,
						// redelivery takes over after the claim timeout.
						ctx.metrics().counter("ingest_errors").inc();
						ctx.errors().record(e.kind(), "ingest", e.to_string());
						log::warn!("service `{}` could not ingest a batch: {}", ctx.name(), e);
					}
				}
				Ok(None) => {
					let until_flush = flush_timeout.checked_sub(last_flush.elapsed()).unwrap_or_default();
					let wait = until_flush.max(Duration::from_millis(10)).min(flush_timeout);
					let notified = self.subscriber.wait_notified(wait).fuse();
					let stopped = ctx.stopped().fuse();
					futures::pin_mut!(notified, stopped);
					futures::select! {
						waited = notified => {
							if let Err(BrokerError::Closed) = waited {
								return Err(ArchiveError::Interrupted);
							}
						},
						_ = stopped => return Ok(()),
					}
				}
				Err(BrokerError::Closed) => return Err(ArchiveError::Interrupted),
				Err(e) => {
					// Database outage: retryable; back off one interval.
					ctx.metrics().counter("poll_errors").inc();
					ctx.errors().record(e.kind(), "poll", e.to_string());
					log::warn!("service `{}` claim failed: {}", ctx.name(), e);
					ctx.sleep(flush_timeout).await?;
				}
			}

			if self.buffer.len() >= self.config.insert_batch_size || last_flush.elapsed() >= flush_timeout {
				match self.flush_and_ack(ctx).await {
					Ok(()) => last_flush = Instant::now(),
					Err(e) => {
						ctx.metrics().counter("flush_errors").inc();
						ctx.errors().record(e.kind(), "flush", e.to_string());
						log::warn!("service `{}` flush failed, retrying next cycle: {}", ctx.name(), e);
						// Keep buffer and staged acks; retry at the next edge.
						last_flush = Instant::now();
					}
				}
			}
		}
	}
}

#[async_trait]
impl<S: TickSink> Worker for BatchIndexer<S> {
	async fn run(&mut self, ctx: &ServiceContext) -> Result<()> {
		let started_at_ms = now_ms();
		let run = match self.config.run_id.clone() {
			Some(run) => run,
			None => discover_run(ctx, &self.storage, started_at_ms, &self.config).await?,
		};
		let metadata = if self.sink.needs_metadata() {
			Some(await_metadata(ctx, &self.storage, &run, &self.config).await?)
		} else {
			None
		};
		self.subscriber.set_run(&run)?;
		self.sink.prepare(&run, metadata.as_ref()).await?;
		log::info!("service `{}` indexing run {}", ctx.name(), run);

		let loop_result = self.main_loop(ctx).await;

		// The guaranteed final flush: every exit path lands here. If it
		// fails too, the service goes to ERROR with the staged work unacked.
		let final_flush = self.flush_and_ack(ctx).await;
		match (loop_result, final_flush) {
			(Err(e), _) if e.kind() != ErrorKind::Interrupted => Err(e),
			(_, Err(e)) => {
				ctx.errors().record(e.kind(), "final flush", e.to_string());
				Err(e)
			}
			(Err(e), Ok(())) => Err(e),
			(Ok(()), Ok(())) => Ok(()),
		}
	}
}
