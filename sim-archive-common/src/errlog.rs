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

//! Bounded per-resource error log: a ring buffer of the last N failures,
//! surfaced through `Service::errors()` and resource diagnostics.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{error::ErrorKind, util::now_ms};

pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
	pub kind: ErrorKind,
	pub message: String,
	/// Where it happened: topic, key, run, whatever identifies the operation.
	pub context: String,
	pub ts_ms: i64,
}

pub struct ErrorLog {
	capacity: usize,
	entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
	}

	pub fn record(&self, kind: ErrorKind, context: impl Into<String>, message: impl Into<String>) {
		let entry = ErrorEntry { kind, message: message.into(), context: context.into(), ts_ms: now_ms() };
		let mut entries = self.entries.lock();
		if entries.len() == self.capacity {
			entries.pop_front();
		}
		entries.push_back(entry);
	}

	/// Oldest-first copy of the retained entries.
	pub fn recent(&self) -> Vec<ErrorEntry> {
		self.entries.lock().iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

impl Default for ErrorLog {
	fn default() -> Self {
		Self::new(DEFAULT_ERROR_LOG_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_buffer_drops_oldest() {
		let log = ErrorLog::new(3);
		for i in 0..5 {
			log.record(ErrorKind::Io, "ctx", format!("err {}", i));
		}
		let recent = log.recent();
		assert_eq!(recent.len(), 3);
		assert_eq!(recent[0].message, "err 2");
		assert_eq!(recent[2].message, "err 4");
	}

	#[test]
	fn entries_carry_kind_and_context() {
		let log = ErrorLog::default();
		log.record(ErrorKind::Protocol, "topic=batches", "bad envelope");
		let e = &log.recent()[0];
		assert_eq!(e.kind, ErrorKind::Protocol);
		assert_eq!(e.context, "topic=batches");
		assert!(e.ts_ms > 0);
	}
}
