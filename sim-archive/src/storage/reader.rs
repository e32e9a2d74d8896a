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
	fs::File,
	io::{BufRead, BufReader, Read},
	marker::PhantomData,
	path::PathBuf,
};

use serde::de::DeserializeOwned;

use super::StorageError;

/// Lazy, finite, single-pass sequence of length-prefixed records. Concurrent
/// readers of the same key each own their own file handle.
pub struct BlobReader<T> {
	key: String,
	file: BufReader<File>,
	failed: bool,
	_marker: PhantomData<T>,
}

impl<T: DeserializeOwned> BlobReader<T> {
	pub(crate) fn open(key: &str, path: PathBuf) -> Result<Self, StorageError> {
		let file = File::open(&path).map_err(|e| match e.kind() {
			std::io::ErrorKind::NotFound => StorageError::NotFound { key: key.to_string() },
			_ => StorageError::io(key, e),
		})?;
		Ok(Self { key: key.to_string(), file: BufReader::new(file), failed: false, _marker: PhantomData })
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	fn read_record(&mut self) -> Result<Option<T>, StorageError> {
		// A clean end of stream is an empty buffer exactly on a record
		// boundary; anything else mid-record is corruption.
		let key = self.key.clone();
		let at_end = self.file.fill_buf().map_err(|e| StorageError::io(&key, e))?.is_empty();
		if at_end {
			return Ok(None);
		}
		let mut len = [0u8; 4];
		self.file
			.read_exact(&mut len)
			.map_err(|_| StorageError::Corrupt { key: self.key.clone(), detail: "truncated length prefix".into() })?;
		let len = u32::from_be_bytes(len) as usize;
		let mut bytes = vec![0u8; len];
		self.file
			.read_exact(&mut bytes)
			.map_err(|_| StorageError::Corrupt { key: self.key.clone(), detail: "truncated record".into() })?;
		let record = rmp_serde::from_slice(&bytes)
			.map_err(|e| StorageError::Corrupt { key: self.key.clone(), detail: e.to_string() })?;
		Ok(Some(record))
	}
}

impl<T: DeserializeOwned> Iterator for BlobReader<T> {
	type Item = Result<T, StorageError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		match self.read_record() {
			Ok(Some(record)) => Some(Ok(record)),
			Ok(None) => None,
			Err(e) => {
				self.failed = true;
				Some(Err(e))
			}
		}
	}
}
