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

//! Cheap process metrics: monotonic counters, sliding-window rates and
//! sliding-window latency percentiles. Recording is O(1) and lock-free;
//! reading walks the window.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::RwLock;

use crate::util::now_secs;

pub const DEFAULT_WINDOW_SECONDS: usize = 60;

/// Histogram bucket upper bounds, in microseconds. The last bucket is
/// open-ended.
const LATENCY_BOUNDS_US: [u64; 19] = [
	50,
	100,
	200,
	500,
	1_000,
	2_000,
	5_000,
	10_000,
	20_000,
	50_000,
	100_000,
	200_000,
	500_000,
	1_000_000,
	2_000_000,
	5_000_000,
	10_000_000,
	30_000_000,
	60_000_000,
];

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
	pub fn new() -> Self {
		Self(AtomicU64::new(0))
	}

	pub fn inc(&self) {
		self.0.fetch_add(1, Ordering::Relaxed);
	}

	pub fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::Relaxed);
	}

	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

/// One slot of a per-second ring. `epoch` is the unix second the slot
/// currently belongs to; a slot older than the window is lazily recycled by
/// the next writer that lands on it.
struct Slot {
	epoch: AtomicU64,
	count: AtomicU64,
}

impl Slot {
	fn new() -> Self {
		Self { epoch: AtomicU64::new(0), count: AtomicU64::new(0) }
	}

	/// Claim this slot for `now`, zeroing it if it belonged to an older
	/// second. Returns whether the slot is valid for `now` afterwards.
	fn roll(&self, now: u64) -> bool {
		let seen = self.epoch.load(Ordering::Acquire);
		if seen == now {
			return true;
		}
		if self.epoch.compare_exchange(seen, now, Ordering::AcqRel, Ordering::Acquire).is_ok() {
			self.count.store(0, Ordering::Release);
			return true;
		}
		// Lost the race; the winner set the same second.
		self.epoch.load(Ordering::Acquire) == now
	}
}

/// Events-per-second over a sliding window of bucketed seconds.
pub struct SlidingRate {
	window: usize,
	slots: Vec<Slot>,
}

impl SlidingRate {
	pub fn new(window_secs: usize) -> Self {
		let window = window_secs.max(1);
		Self { window, slots: (0..window).map(|_| Slot::new()).collect() }
	}

	pub fn record(&self, n: u64) {
		let now = now_secs();
		let slot = &self.slots[(now as usize) % self.slots.len()];
		if slot.roll(now) {
			slot.count.fetch_add(n, Ordering::Relaxed);
		}
	}

	/// Total events inside the window.
	pub fn total(&self) -> u64 {
		let now = now_secs();
		let oldest = now.saturating_sub(self.window as u64 - 1);
		self.slots
			.iter()
			.filter(|s| {
				let e = s.epoch.load(Ordering::Acquire);
				e >= oldest && e <= now
			})
			.map(|s| s.count.load(Ordering::Relaxed))
			.sum()
	}

	pub fn per_second(&self) -> f64 {
		self.total() as f64 / self.window as f64
	}

	pub fn window_seconds(&self) -> usize {
		self.window
	}
}

struct HistogramSlot {
	epoch: AtomicU64,
	counts: Vec<AtomicU64>,
}

impl HistogramSlot {
	fn new() -> Self {
		Self { epoch: AtomicU64::new(0), counts: (0..=LATENCY_BOUNDS_US.len()).map(|_| AtomicU64::new(0)).collect() }
	}

	fn roll(&self, now: u64) -> bool {
		let seen = self.epoch.load(Ordering::Acquire);
		if seen == now {
			return true;
		}
		if self.epoch.compare_exchange(seen, now, Ordering::AcqRel, Ordering::Acquire).is_ok() {
			for c in &self.counts {
				c.store(0, Ordering::Release);
			}
			return true;
		}
		self.epoch.load(Ordering::Acquire) == now
	}
}

/// Latency percentiles over a sliding window of per-second log-bucketed
/// histograms. Resolution is the bucket boundary, which is plenty for a
/// write-latency gauge.
pub struct SlidingHistogram {
	window: usize,
	slots: Vec<HistogramSlot>,
}

impl SlidingHistogram {
	pub fn new(window_secs: usize) -> Self {
		let window = window_secs.max(1);
		Self { window, slots: (0..window).map(|_| HistogramSlot::new()).collect() }
	}

	fn bucket_for(micros: u64) -> usize {
		LATENCY_BOUNDS_US.iter().position(|&b| micros <= b).unwrap_or(LATENCY_BOUNDS_US.len())
	}

	pub fn record(&self, latency: Duration) {
		let micros = latency.as_micros().min(u64::MAX as u128) as u64;
		let now = now_secs();
		let slot = &self.slots[(now as usize) % self.slots.len()];
		if slot.roll(now) {
			slot.counts[Self::bucket_for(micros)].fetch_add(1, Ordering::Relaxed);
		}
	}

	fn merged(&self) -> (Vec<u64>, u64) {
		let now = now_secs();
		let oldest = now.saturating_sub(self.window as u64 - 1);
		let mut merged = vec![0u64; LATENCY_BOUNDS_US.len() + 1];
		let mut total = 0u64;
		for slot in &self.slots {
			let e = slot.epoch.load(Ordering::Acquire);
			if e < oldest || e > now {
				continue;
			}
			for (m, c) in merged.iter_mut().zip(slot.counts.iter()) {
				let c = c.load(Ordering::Relaxed);
				*m += c;
				total += c;
			}
		}
		(merged, total)
	}

	/// `p` in (0, 1]. Returns the upper bound of the bucket holding the
	/// p-quantile, or None when the window is empty.
	pub fn percentile(&self, p: f64) -> Option<Duration> {
		let (merged, total) = self.merged();
		if total == 0 {
			return None;
		}
		let rank = ((p * total as f64).ceil() as u64).clamp(1, total);
		let mut seen = 0u64;
		for (i, count) in merged.iter().enumerate() {
			seen += count;
			if seen >= rank {
				let us = LATENCY_BOUNDS_US.get(i).copied().unwrap_or(LATENCY_BOUNDS_US[LATENCY_BOUNDS_US.len() - 1]);
				return Some(Duration::from_micros(us));
			}
		}
		None
	}
}

/// A snapshot value, keyed by metric name in [`Metrics::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
	Counter(u64),
	RatePerSecond(f64),
	Percentiles { p50_ms: f64, p95_ms: f64, p99_ms: f64 },
}

/// Per-resource / per-service metric registry. Names are static: every call
/// site owns its metric name, the registry only aggregates for `snapshot`.
pub struct Metrics {
	counters: RwLock<BTreeMap<&'static str, Arc<Counter>>>,
	rates: RwLock<BTreeMap<&'static str, Arc<SlidingRate>>>,
	histograms: RwLock<BTreeMap<&'static str, Arc<SlidingHistogram>>>,
	window: usize,
}

impl Metrics {
	pub fn new(window_secs: usize) -> Self {
		Self {
			counters: RwLock::new(BTreeMap::new()),
			rates: RwLock::new(BTreeMap::new()),
			histograms: RwLock::new(BTreeMap::new()),
			window: window_secs.max(1),
		}
	}

	pub fn counter(&self, name: &'static str) -> Arc<Counter> {
		if let Some(c) = self.counters.read().get(name) {
			return Arc::clone(c);
		}
		Arc::clone(self.counters.write().entry(name).or_insert_with(|| Arc::new(Counter::new())))
	}

	pub fn rate(&self, name: &'static str) -> Arc<SlidingRate> {
		if let Some(r) = self.rates.read().get(name) {
			return Arc::clone(r);
		}
		let window = self.window;
		Arc::clone(self.rates.write().entry(name).or_insert_with(|| Arc::new(SlidingRate::new(window))))
	}

	pub fn histogram(&self, name: &'static str) -> Arc<SlidingHistogram> {
		if let Some(h) = self.histograms.read().get(name) {
			return Arc::clone(h);
		}
		let window = self.window;
		Arc::clone(self.histograms.write().entry(name).or_insert_with(|| Arc::new(SlidingHistogram::new(window))))
	}

	pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
		let ms = |d: Option<Duration>| d.map(|d| d.as_secs_f64() * 1_000.0).unwrap_or(0.0);
		let mut out = BTreeMap::new();
		for (name, c) in self.counters.read().iter() {
			out.insert((*name).to_string(), MetricValue::Counter(c.get()));
		}
		for (name, r) in self.rates.read().iter() {
			out.insert(format!("{}_per_second", name), MetricValue::RatePerSecond(r.per_second()));
		}
		for (name, h) in self.histograms.read().iter() {
			out.insert(
				(*name).to_string(),
				MetricValue::Percentiles {
					p50_ms: ms(h.percentile(0.50)),
					p95_ms: ms(h.percentile(0.95)),
					p99_ms: ms(h.percentile(0.99)),
				},
			);
		}
		out
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new(DEFAULT_WINDOW_SECONDS)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counter_counts() {
		let c = Counter::new();
		c.inc();
		c.add(4);
		assert_eq!(c.get(), 5);
	}

	#[test]
	fn rate_sees_recent_events() {
		let r = SlidingRate::new(5);
		r.record(3);
		r.record(2);
		assert_eq!(r.total(), 5);
		assert!((r.per_second() - 1.0).abs() < f64::EPSILON);
	}

	#[test]
	fn histogram_percentiles_are_ordered() {
		let h = SlidingHistogram::new(10);
		for micros in [100u64, 300, 900, 4_000, 40_000, 900_000] {
			h.record(Duration::from_micros(micros));
		}
		let p50 = h.percentile(0.50).unwrap();
		let p99 = h.percentile(0.99).unwrap();
		assert!(p50 <= p99);
		assert!(p99 >= Duration::from_micros(900_000));
	}

	#[test]
	fn empty_histogram_has_no_percentiles() {
		let h = SlidingHistogram::new(10);
		assert_eq!(h.percentile(0.5), None);
	}

	#[test]
	fn snapshot_lists_every_metric() {
		let m = Metrics::new(10);
		m.counter("messages_published").add(7);
		m.rate("ticks_written").record(10);
		m.histogram("write_latency").record(Duration::from_millis(3));
		let snap = m.snapshot();
		assert_eq!(snap.get("messages_published"), Some(&MetricValue::Counter(7)));
		assert!(snap.contains_key("ticks_written_per_second"));
		assert!(matches!(snap.get("write_latency"), Some(MetricValue::Percentiles { .. })));
	}

	#[test]
	fn same_name_returns_same_counter() {
		let m = Metrics::default();
		m.counter("a").inc();
		m.counter("a").inc();
		assert_eq!(m.counter("a").get(), 2);
	}
}
