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

//! Append-only, hierarchical blob store on the local filesystem.
//!
//! Keys use `/` as a purely lexical separator. Writers stream length-prefixed
//! records into `<key>.tmp` and commit with an atomic rename, so a listing
//! never observes a half-written object; `.tmp` leftovers are filtered from
//! every listing.

pub mod reader;
pub mod writer;

use std::{
	io,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use hashbrown::HashSet;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

use sim_archive_common::{errlog::ErrorLog, metrics::Metrics, util::create_dir, ErrorKind, RunId};

use crate::{
	error::{ArchiveError, Result},
	resource::{Resource, UsageContext, UsageState, UsageType, Wrapped, WrapperSet, WrapperTag},
};

pub use self::{reader::BlobReader, writer::BlobWriter};

/// Suffix carried by write-in-progress objects. Never listed.
pub const TMP_SUFFIX: &str = ".tmp";

/// Name of the per-run metadata blob.
pub const METADATA_FILE: &str = "metadata.pb";

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("storage io on `{key}`: {source}")]
	Io { key: String, source: io::Error },
	#[error("`{key}` does not exist")]
	NotFound { key: String },
	#[error("`{key}` already exists")]
	Conflict { key: String },
	#[error("`{key}` is corrupt: {detail}")]
	Corrupt { key: String, detail: String },
	#[error("`{key}` is not a valid storage key")]
	InvalidKey { key: String },
}

impl StorageError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			// NotFound is a routine polling outcome for gating callers.
			StorageError::Io { .. } | StorageError::NotFound { .. } => ErrorKind::Io,
			StorageError::Conflict { .. } => ErrorKind::Conflict,
			StorageError::Corrupt { .. } => ErrorKind::Protocol,
			StorageError::InvalidKey { .. } => ErrorKind::Config,
		}
	}

	pub(crate) fn io(key: &str, source: io::Error) -> Self {
		StorageError::Io { key: key.to_string(), source }
	}
}

/// `batch_<19-digit-start>_<19-digit-end>.pb`. The zero padding makes
/// lexicographic order over listings equal tick order for any non-negative
/// 64-bit tick.
pub fn batch_file_name(tick_start: i64, tick_end: i64) -> String {
	debug_assert!(tick_start >= 0 && tick_end >= tick_start);
	format!("batch_{:019}_{:019}.pb", tick_start, tick_end)
}

pub fn batch_key(run: &RunId, tick_start: i64, tick_end: i64) -> String {
	format!("{}/{}", run, batch_file_name(tick_start, tick_end))
}

pub fn metadata_key(run: &RunId) -> String {
	format!("{}/{}", run, METADATA_FILE)
}

/// Parse `(tick_start, tick_end)` out of a batch file name. Strict about the
/// shape: exactly 19 digits per tick, nothing else accepted.
pub fn parse_batch_file_name(name: &str) -> Option<(i64, i64)> {
	let rest = name.strip_prefix("batch_")?.strip_suffix(".pb")?;
	let (start, end) = (rest.get(..19)?, rest.get(20..)?);
	if rest.as_bytes().get(19) != Some(&b'_') || end.len() != 19 {
		return None;
	}
	if !start.bytes().all(|b| b.is_ascii_digit()) || !end.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	Some((start.parse().ok()?, end.parse().ok()?))
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
	/// Absolute base path for blobs.
	pub root_directory: PathBuf,
	#[serde(default = "default_metrics_window")]
	pub metrics_window_seconds: usize,
}

const fn default_metrics_window() -> usize {
	sim_archive_common::metrics::DEFAULT_WINDOW_SECONDS
}

pub(crate) struct StoreInner {
	root: PathBuf,
	metrics: Arc<Metrics>,
	errors: Arc<ErrorLog>,
	state: RwLock<UsageState>,
}

impl StoreInner {
	fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
		if key.is_empty()
			|| key.starts_with('/')
			|| key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
		{
			return Err(StorageError::InvalidKey { key: key.to_string() });
		}
		let mut path = self.root.clone();
		path.extend(key.split('/'));
		Ok(path)
	}

	fn ensure_active(&self) -> Result<(), StorageError> {
		match *self.state.read() {
			UsageState::Active => Ok(()),
			_ => Err(StorageError::Io {
				key: String::new(),
				source: io::Error::new(io::ErrorKind::Other, "blob store is closed"),
			}),
		}
	}

	pub(crate) fn open_writer(&self, key: &str) -> Result<BlobWriter, StorageError> {
		self.ensure_active()?;
		let path = self.resolve(key)?;
		BlobWriter::create(key, path, self.metrics.counter("blobs_written"), self.metrics.counter("records_written"))
	}

	pub(crate) fn open_reader<T: DeserializeOwned>(&self, key: &str) -> Result<BlobReader<T>, StorageError> {
		self.ensure_active()?;
		let path = self.resolve(key)?;
		self.metrics.counter("blobs_read").inc();
		BlobReader::open(key, path)
	}

	pub(crate) fn read_one<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
		let mut reader = self.open_reader::<T>(key)?;
		match reader.next() {
			Some(Ok(value)) => Ok(value),
			Some(Err(e)) => Err(e),
			None => Err(StorageError::Corrupt { key: key.to_string(), detail: "no records".into() }),
		}
	}

	pub(crate) fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.resolve(key)?.is_file())
	}

	pub(crate) fn list_keys(&self, prefix: &str) -> Result<HashSet<String>, StorageError> {
		self.ensure_active()?;
		let mut keys = HashSet::new();
		let mut stack = vec![self.root.clone()];
		while let Some(dir) = stack.pop() {
			let entries = match std::fs::read_dir(&dir) {
				Ok(entries) => entries,
				Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
				Err(e) => return Err(StorageError::io(prefix, e)),
			};
			for entry in entries {
				let entry = entry.map_err(|e| StorageError::io(prefix, e))?;
				let path = entry.path();
				if path.is_dir() {
					stack.push(path);
					continue;
				}
				let key = match relative_key(&self.root, &path) {
					Some(key) => key,
					None => continue,
				};
				if key.ends_with(TMP_SUFFIX) || !key.starts_with(prefix) {
					continue;
				}
				keys.insert(key);
			}
		}
		Ok(keys)
	}

	/// Run directories whose timestamp prefix is strictly after `after_ms`,
	/// oldest first. Order derives from the run id, not filesystem mtime.
	pub(crate) fn list_run_ids(&self, after_ms: i64) -> Result<Vec<RunId>, StorageError> {
		self.ensure_active()?;
		let entries = match std::fs::read_dir(&self.root) {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::io("", e)),
		};
		let mut runs = Vec::new();
		for entry in entries {
			let entry = entry.map_err(|e| StorageError::io("", e))?;
			if !entry.path().is_dir() {
				continue;
			}
			if let Some(run) = entry.file_name().to_str().and_then(|name| name.parse::<RunId>().ok()) {
				if run.timestamp_ms() > after_ms {
					runs.push(run);
				}
			}
		}
		runs.sort_by_key(|run| (run.timestamp_ms(), run.to_string()));
		Ok(runs)
	}
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
	let rel = path.strip_prefix(root).ok()?;
	let parts: Vec<&str> = rel.iter().map(|seg| seg.to_str()).collect::<Option<_>>()?;
	Some(parts.join("/"))
}

/// The blob-store resource. Capability slices are handed out per service via
/// [`Resource::wrap`].
pub struct FileStore {
	name: String,
	inner: Arc<StoreInner>,
	wrappers: WrapperSet,
}

impl FileStore {
	pub fn open(name: impl Into<String>, config: StorageConfig) -> Result<Self> {
		create_dir(&config.root_directory)?;
		let inner = Arc::new(StoreInner {
			root: config.root_directory,
			metrics: Arc::new(Metrics::new(config.metrics_window_seconds)),
			errors: Arc::new(ErrorLog::default()),
			state: RwLock::new(UsageState::Active),
		});
		Ok(Self { name: name.into(), inner, wrappers: WrapperSet::new() })
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.inner.metrics
	}

	pub fn errors(&self) -> &Arc<ErrorLog> {
		&self.inner.errors
	}

	/// An unwrapped reader for callers outside the resource registry (tests,
	/// operator tooling).
	pub fn reader(&self) -> StorageReader {
		StorageReader { inner: Arc::clone(&self.inner), _tag: self.wrappers.track("direct", UsageType::StorageRead) }
	}

	pub fn writer(&self) -> StorageWriter {
		StorageWriter { inner: Arc::clone(&self.inner), _tag: self.wrappers.track("direct", UsageType::StorageWrite) }
	}
}

#[async_trait]
impl Resource for FileStore {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> &'static str {
		"file-storage"
	}

	fn usage_state(&self, _usage: UsageType) -> UsageState {
		*self.inner.state.read()
	}

	async fn wrap(&self, ctx: &UsageContext) -> Result<Wrapped> {
		self.inner.ensure_active().map_err(ArchiveError::from)?;
		let tag = self.wrappers.track(&ctx.service_name, ctx.usage);
		match ctx.usage {
			UsageType::StorageRead => {
				Ok(Wrapped::StorageReader(StorageReader { inner: Arc::clone(&self.inner), _tag: tag }))
			}
			UsageType::StorageWrite => {
				Ok(Wrapped::StorageWriter(StorageWriter { inner: Arc::clone(&self.inner), _tag: tag }))
			}
			usage => Err(ArchiveError::UnknownUsage { resource: self.name.clone(), usage: usage.to_string() }),
		}
	}

	async fn close(&self) {
		*self.inner.state.write() = UsageState::Closed;
		self.wrappers.warn_leaked(&self.name);
	}
}

/// Read-capability slice of the blob store.
pub struct StorageReader {
	inner: Arc<StoreInner>,
	_tag: Arc<WrapperTag>,
}

impl StorageReader {
	pub fn read_one<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
		self.inner.read_one(key)
	}

	pub fn open_reader<T: DeserializeOwned>(&self, key: &str) -> Result<BlobReader<T>, StorageError> {
		self.inner.open_reader(key)
	}

	pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
		self.inner.exists(key)
	}

	pub fn list_keys(&self, prefix: &str) -> Result<HashSet<String>, StorageError> {
		self.inner.list_keys(prefix)
	}

	pub fn list_run_ids(&self, after_ms: i64) -> Result<Vec<RunId>, StorageError> {
		self.inner.list_run_ids(after_ms)
	}
}

/// Write-capability slice of the blob store. Writers are single-threaded.
pub struct StorageWriter {
	inner: Arc<StoreInner>,
	_tag: Arc<WrapperTag>,
}

impl StorageWriter {
	pub fn open_writer(&self, key: &str) -> Result<BlobWriter, StorageError> {
		self.inner.open_writer(key)
	}

	pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
		self.inner.exists(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sim_archive_common::TickData;

	fn store() -> (tempfile::TempDir, FileStore) {
		let dir = tempfile::tempdir().unwrap();
		let config =
			StorageConfig { root_directory: dir.path().to_path_buf(), metrics_window_seconds: default_metrics_window() };
		let store = FileStore::open("blobs", config).unwrap();
		(dir, store)
	}

	fn tick(n: i64) -> TickData {
		TickData { tick: n, cells: Vec::new() }
	}

	#[test]
	fn batch_file_name_is_zero_padded() {
		assert_eq!(batch_file_name(0, 99), "batch_0000000000000000000_0000000000000000099.pb");
		assert_eq!(parse_batch_file_name("batch_0000000000000000000_0000000000000000099.pb"), Some((0, 99)));
	}

	#[test]
	fn parse_batch_file_name_is_strict() {
		assert_eq!(parse_batch_file_name("batch_0_1.pb"), None);
		assert_eq!(parse_batch_file_name("batch_0000000000000000000_000000000000000009.pb"), None);
		assert_eq!(parse_batch_file_name("batch_000000000000000000x_0000000000000000099.pb"), None);
		assert_eq!(parse_batch_file_name("metadata.pb"), None);
	}

	#[test]
	fn lexicographic_order_equals_tick_order() {
		let ticks = [0i64, 1, 9, 10, 99, 100, 12_345, i64::MAX - 1, i64::MAX];
		let mut names: Vec<String> = ticks.iter().map(|&t| batch_file_name(t, t)).collect();
		names.sort();
		let parsed: Vec<i64> = names.iter().map(|n| parse_batch_file_name(n).unwrap().0).collect();
		let mut sorted = ticks.to_vec();
		sorted.sort_unstable();
		assert_eq!(parsed, sorted);
	}

	#[test]
	fn write_commit_read_round_trip() {
		let (_dir, store) = store();
		let writer = store.writer();
		let mut blob = writer.open_writer("r1/batch_0000000000000000000_0000000000000000002.pb").unwrap();
		for n in 0..3 {
			blob.append(&tick(n)).unwrap();
		}
		blob.commit().unwrap();

		let reader = store.reader();
		let ticks: Vec<TickData> = reader
			.open_reader("r1/batch_0000000000000000000_0000000000000000002.pb")
			.unwrap()
			.collect::<Result<_, _>>()
			.unwrap();
		assert_eq!(ticks.len(), 3);
		assert_eq!(ticks[2].tick, 2);
	}

	#[test]
	fn uncommitted_writer_leaves_no_listed_key() {
		let (_dir, store) = store();
		{
			let writer = store.writer();
			let mut blob = writer.open_writer("r1/pending.pb").unwrap();
			blob.append(&tick(0)).unwrap();
			// dropped without commit
		}
		let reader = store.reader();
		assert!(reader.list_keys("r1/").unwrap().is_empty());
		assert!(!reader.exists("r1/pending.pb").unwrap());
	}

	#[test]
	fn tmp_objects_are_never_listed() {
		let (dir, store) = store();
		std::fs::create_dir_all(dir.path().join("r1")).unwrap();
		std::fs::write(dir.path().join("r1/batch.pb.tmp"), b"half").unwrap();
		std::fs::write(dir.path().join("r1/whole.pb"), b"").unwrap();
		let keys = store.reader().list_keys("r1/").unwrap();
		assert_eq!(keys.len(), 1);
		assert!(keys.contains("r1/whole.pb"));
	}

	#[test]
	fn open_writer_on_existing_key_is_a_conflict() {
		let (_dir, store) = store();
		let writer = store.writer();
		writer.open_writer("a/b.pb").unwrap().commit().unwrap();
		assert!(matches!(writer.open_writer("a/b.pb"), Err(StorageError::Conflict { .. })));
	}

	#[test]
	fn invalid_keys_are_rejected() {
		let (_dir, store) = store();
		let reader = store.reader();
		for key in ["", "/abs", "a//b", "../escape", "a/./b"] {
			assert!(matches!(reader.exists(key), Err(StorageError::InvalidKey { .. })), "key `{}`", key);
		}
	}

	#[test]
	fn truncated_blob_reads_as_corrupt() {
		let (dir, store) = store();
		// a length prefix promising more bytes than the file holds
		std::fs::create_dir_all(dir.path().join("r1")).unwrap();
		std::fs::write(dir.path().join("r1/bad.pb"), [0u8, 0, 0, 40, 1, 2]).unwrap();
		let mut reader = store.reader().open_reader::<TickData>("r1/bad.pb").unwrap();
		assert!(matches!(reader.next(), Some(Err(StorageError::Corrupt { .. }))));
	}

	#[test]
	fn list_run_ids_is_ordered_and_filtered() {
		let (dir, store) = store();
		let mk = |ts: i64| -> RunId {
			format!("{}-550e8400-e29b-41d4-a716-446655440000", ts).parse().unwrap()
		};
		for ts in [300, 100, 200] {
			std::fs::create_dir_all(dir.path().join(mk(ts).to_string())).unwrap();
		}
		std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();
		let runs = store.reader().list_run_ids(100).unwrap();
		let stamps: Vec<i64> = runs.iter().map(|r| r.timestamp_ms()).collect();
		assert_eq!(stamps, vec![200, 300]);
	}

	#[test]
	fn read_one_returns_the_first_record() {
		let (_dir, store) = store();
		let mut blob = store.writer().open_writer("r1/metadata.pb").unwrap();
		blob.append(&tick(7)).unwrap();
		blob.commit().unwrap();
		let t: TickData = store.reader().read_one("r1/metadata.pb").unwrap();
		assert_eq!(t.tick, 7);
	}
}
