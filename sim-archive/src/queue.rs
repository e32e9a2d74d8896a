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

//! In-memory bounded queue resource: the hand-off between a producer and its
//! persistence service inside one process. Payloads are opaque bytes.

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_std::future::timeout;
use async_trait::async_trait;
use serde::Deserialize;

use sim_archive_common::{metrics::Metrics, Counter};

use crate::{
	error::{ArchiveError, Result},
	resource::{Resource, UsageContext, UsageState, UsageType, Wrapped, WrapperSet, WrapperTag},
};

#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
	#[serde(default = "default_capacity")]
	pub capacity: usize,
	#[serde(default = "default_metrics_window")]
	pub metrics_window_seconds: usize,
}

const fn default_capacity() -> usize {
	1_024
}

const fn default_metrics_window() -> usize {
	sim_archive_common::metrics::DEFAULT_WINDOW_SECONDS
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self { capacity: default_capacity(), metrics_window_seconds: default_metrics_window() }
	}
}

pub struct MemoryQueue {
	name: String,
	tx: flume::Sender<Vec<u8>>,
	rx: flume::Receiver<Vec<u8>>,
	metrics: Arc<Metrics>,
	closed: Arc<AtomicBool>,
	wrappers: WrapperSet,
}

impl MemoryQueue {
	pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
		let (tx, rx) = flume::bounded(config.capacity.max(1));
		Self {
			name: name.into(),
			tx,
			rx,
			metrics: Arc::new(Metrics::new(config.metrics_window_seconds)),
			closed: Arc::new(AtomicBool::new(false)),
			wrappers: WrapperSet::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
	}
}

#[async_trait]
impl Resource for MemoryQueue {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> &'static str {
		"memory-queue"
	}

	fn usage_state(&self, _usage: UsageType) -> UsageState {
		if self.closed.load(Ordering::Acquire) {
			UsageState::Closed
		} else {
			UsageState::Active
		}
	}

	async fn wrap(&self, ctx: &UsageContext) -> Result<Wrapped> {
		if self.closed.load(Ordering::Acquire) {
			return Err(ArchiveError::Config(format!("queue `{}` is closed", self.name)));
		}
		let tag = self.wrappers.track(&ctx.service_name, ctx.usage);
		match ctx.usage {
			UsageType::QueueIn => Ok(Wrapped::QueueIn(QueueIn {
				tx: self.tx.clone(),
				put: self.metrics.counter("items_put"),
				closed: Arc::clone(&self.closed),
				_tag: tag,
			})),
			UsageType::QueueOut => Ok(Wrapped::QueueOut(QueueOut {
				rx: self.rx.clone(),
				taken: self.metrics.counter("items_taken"),
				closed: Arc::clone(&self.closed),
				_tag: tag,
			})),
			usage => Err(ArchiveError::UnknownUsage { resource: self.name.clone(), usage: usage.to_string() }),
		}
	}

	async fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.wrappers.warn_leaked(&self.name);
	}
}

/// Producer side. `put` blocks while the queue is full.
pub struct QueueIn {
	tx: flume::Sender<Vec<u8>>,
	put: Arc<Counter>,
	closed: Arc<AtomicBool>,
	_tag: Arc<WrapperTag>,
}

impl QueueIn {
	pub async fn put(&self, item: Vec<u8>) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(ArchiveError::Channel);
		}
		self.tx.send_async(item).await.map_err(|_| ArchiveError::Channel)?;
		self.put.inc();
		Ok(())
	}
}

/// Consumer side.
pub struct QueueOut {
	rx: flume::Receiver<Vec<u8>>,
	taken: Arc<Counter>,
	closed: Arc<AtomicBool>,
	_tag: Arc<WrapperTag>,
}

impl QueueOut {
	pub async fn take(&self) -> Result<Vec<u8>> {
		if self.closed.load(Ordering::Acquire) {
			return Err(ArchiveError::Channel);
		}
		let item = self.rx.recv_async().await.map_err(|_| ArchiveError::Channel)?;
		self.taken.inc();
		Ok(item)
	}

	/// Bounded wait; `None` when nothing arrived within the deadline.
	pub async fn poll(&self, wait: Duration) -> Result<Option<Vec<u8>>> {
		match timeout(wait, self.take()).await {
			Ok(result) => result.map(Some),
			Err(_elapsed) => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_std::task;

	#[test]
	fn put_then_take() {
		task::block_on(async {
			let queue = MemoryQueue::new("out-queue", QueueConfig::default());
			let put = queue.wrap(&UsageContext::new("producer", UsageType::QueueIn)).await.unwrap();
			let take = queue.wrap(&UsageContext::new("persistence", UsageType::QueueOut)).await.unwrap();
			let (put, take) = (put.into_queue_in().unwrap(), take.into_queue_out().unwrap());

			put.put(vec![1, 2, 3]).await.unwrap();
			assert_eq!(take.take().await.unwrap(), vec![1, 2, 3]);
			assert_eq!(take.poll(Duration::from_millis(20)).await.unwrap(), None);
		});
	}

	#[test]
	fn rejects_wrong_usage() {
		task::block_on(async {
			let queue = MemoryQueue::new("out-queue", QueueConfig::default());
			let err = match queue.wrap(&UsageContext::new("svc", UsageType::TopicRead)).await {
				Ok(_) => panic!("expected an error"),
				Err(e) => e,
			};
			assert!(matches!(err, ArchiveError::UnknownUsage { .. }));
		});
	}
}
