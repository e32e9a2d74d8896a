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

use std::{
	convert::TryFrom,
	fs::{File, OpenOptions},
	io::{BufWriter, Write},
	path::PathBuf,
	sync::Arc,
};

use serde::Serialize;

use sim_archive_common::Counter;

use super::{StorageError, TMP_SUFFIX};

/// Streaming blob sink. Records are length-prefixed (u32 big-endian) and go
/// into `<key>.tmp`; [`commit`](Self::commit) flushes, fsyncs and atomically
/// renames to the final key. Dropping an uncommitted writer removes the
/// temporary, so only a process crash can leave one behind.
pub struct BlobWriter {
	key: String,
	tmp_path: PathBuf,
	final_path: PathBuf,
	file: Option<BufWriter<File>>,
	committed: bool,
	records: u64,
	blobs_written: Arc<Counter>,
	records_written: Arc<Counter>,
}

impl BlobWriter {
	pub(crate) fn create(
		key: &str,
		final_path: PathBuf,
		blobs_written: Arc<Counter>,
		records_written: Arc<Counter>,
	) -> Result<Self, StorageError> {
		if final_path.exists() {
			return Err(StorageError::Conflict { key: key.to_string() });
		}
		if let Some(parent) = final_path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| StorageError::io(key, e))?;
		}
		let mut tmp_path = final_path.clone();
		let mut file_name = tmp_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		file_name.push(TMP_SUFFIX);
		tmp_path.set_file_name(file_name);

		// create_new: a second writer racing for the same key loses here.
		let file = OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&tmp_path)
			.map_err(|e| match e.kind() {
				std::io::ErrorKind::AlreadyExists => StorageError::Conflict { key: key.to_string() },
				_ => StorageError::io(key, e),
			})?;

		Ok(Self {
			key: key.to_string(),
			tmp_path,
			final_path,
			file: Some(BufWriter::new(file)),
			committed: false,
			records: 0,
			blobs_written,
			records_written,
		})
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn records(&self) -> u64 {
		self.records
	}

	/// Append one serialised record.
	pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), StorageError> {
		let bytes = rmp_serde::to_vec(record)
			.map_err(|e| StorageError::Corrupt { key: self.key.clone(), detail: e.to_string() })?;
		self.append_bytes(&bytes)
	}

	pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
		let key = self.key.clone();
		let file = self.file.as_mut().expect("writer used after commit");
		let len =
			u32::try_from(bytes.len()).map_err(|_| StorageError::Corrupt { key: key.clone(), detail: "record over 4GiB".into() })?;
		file.write_all(&len.to_be_bytes()).map_err(|e| StorageError::io(&key, e))?;
		file.write_all(bytes).map_err(|e| StorageError::io(&key, e))?;
		self.records += 1;
		Ok(())
	}

	/// Flush, force the medium and atomically publish the key.
	pub fn commit(mut self) -> Result<(), StorageError> {
		let mut file = self.file.take().expect("writer used after commit");
		file.flush().map_err(|e| StorageError::io(&self.key, e))?;
		file.get_ref().sync_all().map_err(|e| StorageError::io(&self.key, e))?;
		drop(file);
		std::fs::rename(&self.tmp_path, &self.final_path).map_err(|e| StorageError::io(&self.key, e))?;
		self.committed = true;
		self.blobs_written.inc();
		self.records_written.add(self.records);
		log::debug!("committed blob `{}` ({} records)", self.key, self.records);
		Ok(())
	}
}

impl Drop for BlobWriter {
	fn drop(&mut self) {
		if !self.committed {
			drop(self.file.take());
			if let Err(e) = std::fs::remove_file(&self.tmp_path) {
				if e.kind() != std::io::ErrorKind::NotFound {
					log::warn!("could not remove abandoned temporary for `{}`: {}", self.key, e);
				}
			}
		}
	}
}
