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

//! Clock and filesystem odds and ends.

use std::{
	io,
	path::{Path, PathBuf},
	time::{SystemTime, UNIX_EPOCH},
};

/// Wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Wall clock in unix seconds.
pub fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Get the path to a local directory where we can save data.
/// Platform | Value | Example
/// -- | -- | --
/// Linux | $XDG_DATA_HOME or $HOME/.local/share/sim_archive | /home/alice/.local/share/sim_archive/
/// macOS | $HOME/Library/Application Support/sim_archive | /Users/Alice/Library/Application Support/sim_archive/
/// Windows | {FOLDERID_LocalAppData}\sim_archive | C:\Users\Alice\AppData\Local\sim_archive
pub fn sim_archive_dir() -> io::Result<PathBuf> {
	if let Some(base_dirs) = dirs::BaseDirs::new() {
		let mut path = base_dirs.data_local_dir().to_path_buf();
		path.push("sim_archive");
		Ok(path)
	} else {
		Err(io::Error::new(io::ErrorKind::NotFound, "no valid home directory path could be retrieved"))
	}
}

/// Create an arbitrary directory on disk, tolerating it already existing.
pub fn create_dir(path: &Path) -> io::Result<()> {
	match std::fs::create_dir_all(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
		Err(e) => Err(e),
	}
}
