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

//! The broker's universal message wrapper. The broker persists and routes
//! envelopes without ever looking inside the payload; consumers resolve the
//! concrete type from the payload's type url.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use sim_archive_common::util::now_ms;

use crate::error::{BrokerError, Result};

/// A self-describing payload: a type url plus the MessagePack bytes of the
/// named type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyPayload {
	pub type_url: String,
	pub value: Vec<u8>,
}

impl AnyPayload {
	pub fn pack<T: Serialize>(type_url: &str, payload: &T) -> Result<Self> {
		Ok(Self { type_url: type_url.to_string(), value: rmp_serde::to_vec(payload)? })
	}

	pub fn is(&self, type_url: &str) -> bool {
		self.type_url == type_url
	}

	/// Decode the payload as `T`, checking the type url first.
	pub fn unpack<T: DeserializeOwned>(&self, type_url: &str) -> Result<T> {
		if !self.is(type_url) {
			return Err(BrokerError::PayloadType { expected: type_url.to_string(), found: self.type_url.clone() });
		}
		Ok(rmp_serde::from_slice(&self.value)?)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	/// Generated at publish time.
	pub message_id: String,
	/// Wall clock at publish time.
	pub ts_ms: i64,
	pub payload: AnyPayload,
}

impl Envelope {
	/// Wrap a payload for publishing: fresh message id, current wall clock.
	pub fn wrap<T: Serialize>(type_url: &str, payload: &T) -> Result<Self> {
		Ok(Self { message_id: Uuid::new_v4().to_string(), ts_ms: now_ms(), payload: AnyPayload::pack(type_url, payload)? })
	}

	pub fn encode(&self) -> Result<Vec<u8>> {
		Ok(rmp_serde::to_vec(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		Ok(rmp_serde::from_slice(bytes)?)
	}
}
