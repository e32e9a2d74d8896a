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

use thiserror::Error;

use sim_archive_common::ErrorKind;

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),

	#[error("envelope encode: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("envelope decode: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("notification payload: {0}")]
	NotifyPayload(#[from] serde_json::Error),
	#[error("payload is `{found}`, expected `{expected}`")]
	PayloadType { expected: String, found: String },

	#[error("no simulation run bound; call set_run before the first publish")]
	RunNotSet,
	#[error("already bound to run {bound}, refusing rebind to {requested}")]
	RunRebound { bound: String, requested: String },

	#[error("broker is closed")]
	Closed,
	#[error("ack token {0} does not resolve to a message row")]
	UnknownAckToken(i64),
}

impl BrokerError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			BrokerError::Sql(_) => ErrorKind::Io,
			BrokerError::Encode(_) | BrokerError::Decode(_) | BrokerError::NotifyPayload(_) => ErrorKind::Protocol,
			BrokerError::PayloadType { .. } => ErrorKind::Protocol,
			BrokerError::RunNotSet | BrokerError::RunRebound { .. } => ErrorKind::Config,
			BrokerError::Closed => ErrorKind::Interrupted,
			BrokerError::UnknownAckToken(_) => ErrorKind::Bug,
		}
	}
}
