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

//! The error-kind taxonomy every crate in the workspace maps its concrete
//! errors onto. Kinds drive policy (retry, skip, die), not types.

use std::fmt;

/// Coarse classification of a failure. The policy attached to each kind:
///
/// * `Config`: fatal at startup, the owning service never enters RUNNING.
/// * `Io`: retryable; surfaced as WARN, recorded, caller continues.
/// * `Protocol`: one message is skipped, never acked.
/// * `Conflict`: idempotent success, logged at DEBUG.
/// * `Timeout`: fatal for the calling service.
/// * `Interrupted`: clean exit, invariants preserved.
/// * `Bug`: unexpected; ERROR state, no auto-restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Config,
	Io,
	Protocol,
	Conflict,
	Timeout,
	Interrupted,
	Bug,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Config => "config",
			ErrorKind::Io => "io",
			ErrorKind::Protocol => "protocol",
			ErrorKind::Conflict => "conflict",
			ErrorKind::Timeout => "timeout",
			ErrorKind::Interrupted => "interrupted",
			ErrorKind::Bug => "bug",
		}
	}

	/// Whether a caller may keep running after observing this kind.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ErrorKind::Io | ErrorKind::Conflict)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
