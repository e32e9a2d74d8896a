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

//! The broker's wake-up edge: a Postgres LISTEN task that fans row-insert
//! notifications out to per-subscriber in-memory buffers.
//!
//! The trigger payload is advisory only. Subscribers always re-check the
//! claim statement, so a dropped, duplicated or foreign notification is
//! harmless.

use std::{
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

use async_std::{
	future::timeout,
	task::{self, JoinHandle},
};
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use std::collections::HashMap;

use crate::error::Result;

/// The single NOTIFY channel all message-table triggers fire on.
pub const NOTIFY_CHANNEL: &str = "sim_topic_messages";

/// A notification from Postgres about a freshly inserted message row.
#[derive(PartialEq, Debug, Deserialize)]
pub struct Notif {
	pub topic: String,
	pub id: i64,
}

/// Fans notifications out to every registered subscriber buffer of the
/// notification's topic. Buffers are unbounded and the offer never blocks.
pub struct Router {
	inner: RwLock<HashMap<String, Vec<(u64, flume::Sender<i64>)>>>,
	next_id: AtomicU64,
}

impl Router {
	pub fn new() -> Self {
		Self { inner: RwLock::new(HashMap::new()), next_id: AtomicU64::new(0) }
	}

	/// Register a new buffer for `topic`. The returned token deregisters it.
	pub fn register(&self, topic: &str) -> (u64, flume::Receiver<i64>) {
		let (tx, rx) = flume::unbounded();
		let token = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner.write().entry(topic.to_string()).or_default().push((token, tx));
		(token, rx)
	}

	pub fn deregister(&self, topic: &str, token: u64) {
		let mut inner = self.inner.write();
		if let Some(buffers) = inner.get_mut(topic) {
			buffers.retain(|(t, _)| *t != token);
			if buffers.is_empty() {
				inner.remove(topic);
			}
		}
	}

	pub fn dispatch(&self, notif: &Notif) {
		if let Some(buffers) = self.inner.read().get(&notif.topic) {
			for (_, tx) in buffers {
				// A dead receiver is deregistered on wrapper drop; ignore it here.
				let _ = tx.send(notif.id);
			}
		}
	}

	/// Drop every buffer, waking all blocked subscribers with a disconnect.
	pub fn clear(&self) {
		self.inner.write().clear();
	}
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

/// A Postgres listener task pumping [`NOTIFY_CHANNEL`] into a [`Router`].
/// Dropping this kills the task.
pub struct Listener {
	tx: flume::Sender<()>,
	handle: Option<JoinHandle<()>>,
}

impl Listener {
	/// Connect and start listening before returning, so a notification sent
	/// right after `spawn` resolves cannot be missed.
	pub async fn spawn(db_url: &str, router: std::sync::Arc<Router>) -> Result<Self> {
		let mut listener = PgListener::connect(db_url).await?;
		listener.listen(NOTIFY_CHANNEL).await?;

		let (tx, rx) = flume::bounded(1);
		let fut = async move {
			let mut stream = listener.into_stream();
			loop {
				let mut next = stream.next().fuse();
				futures::select! {
					notif = next => {
						match notif {
							Some(Ok(n)) => match serde_json::from_str::<Notif>(n.payload()) {
								Ok(notif) => router.dispatch(&notif),
								Err(e) => log::warn!("undecodable topic notification `{}`: {}", n.payload(), e),
							},
							Some(Err(e)) => log::warn!("topic listener: {}", e),
							None => break,
						}
					},
					_ = rx.recv_async().fuse() => break,
					complete => break,
				}
			}
			// Collect what already arrived before going away, as long as the
			// collection completes quickly.
			if timeout(Duration::from_secs(1), async {
				while let Some(Ok(n)) = stream.next().await {
					if let Ok(notif) = serde_json::from_str::<Notif>(n.payload()) {
						router.dispatch(&notif);
					}
				}
			})
			.await
			.is_err()
			{
				log::warn!("clean-up notification collection timed out");
			}
		};

		let handle = Some(task::spawn(fut));
		Ok(Listener { tx, handle })
	}

	pub async fn kill(&mut self) {
		let _ = self.tx.send_async(()).await;
		if let Some(handle) = self.handle.take() {
			handle.await;
		}
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		let _ = self.tx.send(());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn notif_deserializes_from_trigger_payload() {
		let json = serde_json::json!({ "topic": "batches", "id": 1337 });
		let notif: Notif = serde_json::from_value(json).unwrap();
		assert_eq!(notif, Notif { topic: "batches".into(), id: 1337 });
	}

	#[test]
	fn router_dispatches_to_matching_topic_only() {
		let router = Router::new();
		let (_a, rx_a) = router.register("a");
		let (_b, rx_b) = router.register("b");
		router.dispatch(&Notif { topic: "a".into(), id: 7 });
		assert_eq!(rx_a.try_recv().ok(), Some(7));
		assert!(rx_b.try_recv().is_err());
	}

	#[test]
	fn router_fans_out_to_all_buffers_of_a_topic() {
		let router = Router::new();
		let (_t1, rx1) = router.register("a");
		let (_t2, rx2) = router.register("a");
		router.dispatch(&Notif { topic: "a".into(), id: 9 });
		assert_eq!(rx1.try_recv().ok(), Some(9));
		assert_eq!(rx2.try_recv().ok(), Some(9));
	}

	#[test]
	fn deregistered_buffer_stops_receiving() {
		let router = Router::new();
		let (token, rx) = router.register("a");
		router.deregister("a", token);
		router.dispatch(&Notif { topic: "a".into(), id: 1 });
		assert!(rx.try_recv().is_err());
	}
}
