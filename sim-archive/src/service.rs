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

//! Uniform service lifecycle: every long-running body gets a dedicated
//! worker thread, a one-way state machine (PAUSED <-> RUNNING being the only
//! back edge), cooperative pause points and a bounded error log.
//!
//! The stop channel is the cancellation signal. Dropping its sender wakes
//! every suspension point at once, so a blocked body observes the stop at
//! its next `check_pause`/`sleep` and unwinds cleanly.

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_std::task;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use timer::Delay;

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, ErrorEntry, ErrorKind};

use crate::error::{ArchiveError, Result};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
	New,
	Starting,
	Running,
	Paused,
	Stopping,
	Stopped,
	Error,
}

impl fmt::Display for ServiceState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let s = match self {
			ServiceState::New => "NEW",
			ServiceState::Starting => "STARTING",
			ServiceState::Running => "RUNNING",
			ServiceState::Paused => "PAUSED",
			ServiceState::Stopping => "STOPPING",
			ServiceState::Stopped => "STOPPED",
			ServiceState::Error => "ERROR",
		};
		f.write_str(s)
	}
}

/// A service body. Run on a dedicated worker; expected to hit a cooperative
/// point ([`ServiceContext::check_pause`] or [`ServiceContext::sleep`])
/// regularly.
#[async_trait]
pub trait Worker: Send + 'static {
	async fn run(&mut self, ctx: &ServiceContext) -> Result<()>;
}

struct Shared {
	name: String,
	state: Mutex<ServiceState>,
	pause: AtomicBool,
	stopping: AtomicBool,
	resume_rx: flume::Receiver<()>,
	stop_rx: flume::Receiver<()>,
	metrics: Arc<Metrics>,
	errors: Arc<ErrorLog>,
}

impl Shared {
	fn set_state(&self, state: ServiceState) {
		*self.state.lock() = state;
	}
}

/// The body-facing half of a service.
pub struct ServiceContext {
	shared: Arc<Shared>,
}

impl ServiceContext {
	pub fn name(&self) -> &str {
		&self.shared.name
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.shared.metrics
	}

	pub fn errors(&self) -> &Arc<ErrorLog> {
		&self.shared.errors
	}

	/// True once stop has been requested; loop bodies should exit promptly.
	pub fn stopping(&self) -> bool {
		self.shared.stopping.load(Ordering::Acquire)
	}

	/// Cooperative pause point. Blocks while the pause flag is set; returns
	/// `Err(Interrupted)` when stop arrives first.
	pub async fn check_pause(&self) -> Result<()> {
		if self.stopping() {
			return Err(ArchiveError::Interrupted);
		}
		if !self.shared.pause.load(Ordering::Acquire) {
			return Ok(());
		}
		self.shared.set_state(ServiceState::Paused);
		log::info!("service `{}` paused", self.shared.name);
		loop {
			futures::select! {
				resumed = self.shared.resume_rx.recv_async().fuse() => {
					if resumed.is_err() || self.stopping() {
						return Err(ArchiveError::Interrupted);
					}
					if !self.shared.pause.load(Ordering::Acquire) {
						self.shared.set_state(ServiceState::Running);
						log::info!("service `{}` resumed", self.shared.name);
						return Ok(());
					}
				},
				_ = self.shared.stop_rx.recv_async().fuse() => {
					return Err(ArchiveError::Interrupted);
				},
			}
		}
	}

	/// Resolves once stop is requested. For composing selects around waits
	/// that must not outlive the service.
	pub async fn stopped(&self) {
		if self.stopping() {
			return;
		}
		// The sender is dropped on stop, failing every pending recv.
		let _ = self.shared.stop_rx.recv_async().await;
	}

	/// Interruptible sleep; `Err(Interrupted)` when stop arrives first.
	pub async fn sleep(&self, duration: Duration) -> Result<()> {
		if self.stopping() {
			return Err(ArchiveError::Interrupted);
		}
		let mut delay = Delay::new(duration).fuse();
		futures::select! {
			_ = delay => Ok(()),
			_ = self.shared.stop_rx.recv_async().fuse() => Err(ArchiveError::Interrupted),
		}
	}
}

/// Handle owning one supervised service.
pub struct Service {
	shared: Arc<Shared>,
	resume_tx: flume::Sender<()>,
	stop_tx: Mutex<Option<flume::Sender<()>>>,
	done_rx: flume::Receiver<()>,
	done_tx: Mutex<Option<flume::Sender<()>>>,
	stop_timeout: Duration,
	worker: Mutex<Option<Box<dyn Worker>>>,
	handle: Mutex<Option<jod_thread::JoinHandle<()>>>,
}

impl Service {
	pub fn new(name: impl Into<String>, worker: Box<dyn Worker>) -> Self {
		Self::with_stop_timeout(name, worker, DEFAULT_STOP_TIMEOUT)
	}

	pub fn with_stop_timeout(name: impl Into<String>, worker: Box<dyn Worker>, stop_timeout: Duration) -> Self {
		let (resume_tx, resume_rx) = flume::unbounded();
		let (stop_tx, stop_rx) = flume::bounded(1);
		let (done_tx, done_rx) = flume::bounded(1);
		let shared = Arc::new(Shared {
			name: name.into(),
			state: Mutex::new(ServiceState::New),
			pause: AtomicBool::new(false),
			stopping: AtomicBool::new(false),
			resume_rx,
			stop_rx,
			metrics: Arc::new(Metrics::default()),
			errors: Arc::new(ErrorLog::default()),
		});
		Self {
			shared,
			resume_tx,
			stop_tx: Mutex::new(Some(stop_tx)),
			done_rx,
			done_tx: Mutex::new(Some(done_tx)),
			stop_timeout,
			worker: Mutex::new(Some(worker)),
			handle: Mutex::new(None),
		}
	}

	pub fn name(&self) -> &str {
		&self.shared.name
	}

	pub fn state(&self) -> ServiceState {
		*self.shared.state.lock()
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.shared.metrics
	}

	pub fn errors(&self) -> Vec<ErrorEntry> {
		self.shared.errors.recent()
	}

	/// NEW -> STARTING -> RUNNING, then run the body on a dedicated worker
	/// thread. Starting twice is a configuration error.
	pub fn start(&self) -> Result<()> {
		{
			let mut state = self.shared.state.lock();
			if *state != ServiceState::New {
				return Err(ArchiveError::Config(format!(
					"service `{}` cannot start from {}",
					self.shared.name, *state
				)));
			}
			*state = ServiceState::Starting;
		}
		let mut worker = self
			.worker
			.lock()
			.take()
			.ok_or_else(|| ArchiveError::Config(format!("service `{}` has no body", self.shared.name)))?;
		let done_tx = self.done_tx.lock().take();
		let shared = Arc::clone(&self.shared);

		let handle = jod_thread::Builder::new()
			.name(shared.name.clone())
			.spawn(move || {
				let ctx = ServiceContext { shared: Arc::clone(&shared) };
				shared.set_state(ServiceState::Running);
				log::info!("service `{}` running", shared.name);
				let result = task::block_on(worker.run(&ctx));
				match result {
					Ok(()) => {
						shared.set_state(ServiceState::Stopped);
						log::info!("service `{}` stopped", shared.name);
					}
					Err(e) if e.kind() == ErrorKind::Interrupted => {
						shared.set_state(ServiceState::Stopped);
						log::info!("service `{}` stopped (interrupted)", shared.name);
					}
					Err(e) => {
						shared.errors.record(e.kind(), "service body", e.to_string());
						shared.set_state(ServiceState::Error);
						log::error!("service `{}` failed: {}", shared.name, e);
					}
				}
				drop(done_tx);
			})
			.map_err(ArchiveError::Io)?;
		*self.handle.lock() = Some(handle);
		Ok(())
	}

	/// Set the pause flag; the body parks at its next cooperative point.
	pub fn pause(&self) {
		self.shared.pause.store(true, Ordering::Release);
	}

	pub fn resume(&self) {
		self.shared.pause.store(false, Ordering::Release);
		let _ = self.resume_tx.send(());
	}

	/// Request stop and wait up to the stop timeout. Exceeding the timeout
	/// forces ERROR; in-flight deliveries get redelivered after their claim
	/// timeout.
	pub fn stop(&self) -> Result<()> {
		{
			let mut state = self.shared.state.lock();
			match *state {
				ServiceState::New | ServiceState::Stopped | ServiceState::Error => return Ok(()),
				_ => *state = ServiceState::Stopping,
			}
		}
		self.shared.stopping.store(true, Ordering::Release);
		// Dropping the sender wakes every suspension point at once.
		drop(self.stop_tx.lock().take());
		let _ = self.resume_tx.send(());

		if !self.await_termination(self.stop_timeout) {
			self.shared.errors.record(
				ErrorKind::Timeout,
				"stop",
				format!("body did not exit within {:?}", self.stop_timeout),
			);
			self.shared.set_state(ServiceState::Error);
			return Err(ArchiveError::Timeout {
				what: format!("stopping service `{}`", self.shared.name),
				waited_ms: self.stop_timeout.as_millis() as u64,
			});
		}
		// The body sets its own terminal state; this only covers the race
		// where it exited between the state check above and the join.
		let mut state = self.shared.state.lock();
		if *state == ServiceState::Stopping {
			*state = ServiceState::Stopped;
		}
		Ok(())
	}

	/// True once the body has exited (any terminal state).
	pub fn await_termination(&self, timeout: Duration) -> bool {
		match self.done_rx.recv_timeout(timeout) {
			// The worker only ever drops its end.
			Err(flume::RecvTimeoutError::Disconnected) => true,
			Err(flume::RecvTimeoutError::Timeout) => false,
			Ok(()) => true,
		}
	}
}
