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

use std::io;

use thiserror::Error;

use sim_archive_common::ErrorKind;
use sim_broker::BrokerError;

use crate::storage::StorageError;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Archive error enum. `kind()` maps every variant onto the shared policy
/// taxonomy.
#[derive(Debug, Error)]
pub enum ArchiveError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error(transparent)]
	Broker(#[from] BrokerError),
	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error(transparent)]
	Fmt(#[from] std::fmt::Error),
	#[error("encode: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("decode: {0}")]
	Decode(#[from] rmp_serde::decode::Error),

	#[error("configuration: {0}")]
	Config(String),
	#[error("resource `{resource}` does not recognise usage `{usage}`")]
	UnknownUsage { resource: String, usage: String },
	#[error("expected a {expected} wrapper")]
	WrongCapability { expected: &'static str },
	#[error("no factory registered for kind `{0}`")]
	UnknownFactory(String),
	#[error("resource `{0}` is already registered")]
	DuplicateResource(String),
	#[error("resource `{0}` is not registered")]
	MissingResource(String),

	#[error("no simulation run bound; call set_run first")]
	RunNotSet,
	#[error("run metadata is required but was not provided")]
	MissingMetadata,

	#[error("{what} did not complete within {waited_ms}ms")]
	Timeout { what: String, waited_ms: u64 },
	#[error("interrupted")]
	Interrupted,
	#[error("sending on a disconnected channel")]
	Channel,
}

impl ArchiveError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ArchiveError::Io(_) | ArchiveError::Sql(_) => ErrorKind::Io,
			ArchiveError::Broker(e) => e.kind(),
			ArchiveError::Storage(e) => e.kind(),
			ArchiveError::Encode(_) | ArchiveError::Decode(_) => ErrorKind::Protocol,
			ArchiveError::Fmt(_) => ErrorKind::Bug,
			ArchiveError::Config(_)
			| ArchiveError::UnknownUsage { .. }
			| ArchiveError::WrongCapability { .. }
			| ArchiveError::UnknownFactory(_)
			| ArchiveError::DuplicateResource(_)
			| ArchiveError::MissingResource(_)
			| ArchiveError::RunNotSet
			| ArchiveError::MissingMetadata => ErrorKind::Config,
			ArchiveError::Timeout { .. } => ErrorKind::Timeout,
			ArchiveError::Interrupted => ErrorKind::Interrupted,
			ArchiveError::Channel => ErrorKind::Bug,
		}
	}
}

impl<T> From<flume::SendError<T>> for ArchiveError {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}
