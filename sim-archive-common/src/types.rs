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

//! Payloads and identifiers flowing between the simulation producer, the
//! broker and the indexers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::util::now_ms;

/// Identifier of one simulation execution: `<unix-millis>-<uuid>`.
///
/// Every durable artifact (blob keys, database schemas, topic payloads) names
/// its run through this id. The timestamp prefix makes run ids sortable by
/// start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId {
	ts_ms: i64,
	uuid: Uuid,
}

impl RunId {
	pub fn generate() -> Self {
		Self { ts_ms: now_ms(), uuid: Uuid::new_v4() }
	}

	pub fn new(ts_ms: i64, uuid: Uuid) -> Self {
		Self { ts_ms, uuid }
	}

	/// Millisecond timestamp the run was started at.
	pub fn timestamp_ms(&self) -> i64 {
		self.ts_ms
	}

	/// The database schema owned by this run: `sim_` plus the id with every
	/// `-` flattened to `_`. Stays well under Postgres's 63-byte identifier
	/// limit and contains only `[a-z0-9_]`.
	pub fn schema_name(&self) -> String {
		format!("sim_{}", self.to_string().replace('-', "_"))
	}
}

impl fmt::Display for RunId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}-{}", self.ts_ms, self.uuid)
	}
}

impl FromStr for RunId {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (ts, uuid) = s.split_at(s.find('-').ok_or_else(|| format!("run id `{}` has no timestamp prefix", s))?);
		let ts_ms = ts.parse::<i64>().map_err(|e| format!("run id `{}`: bad timestamp: {}", s, e))?;
		let uuid = Uuid::parse_str(&uuid[1..]).map_err(|e| format!("run id `{}`: bad uuid: {}", s, e))?;
		if ts_ms < 0 {
			return Err(format!("run id `{}` has a negative timestamp", s));
		}
		Ok(Self { ts_ms, uuid })
	}
}

impl Serialize for RunId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for RunId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// Topic payload announcing one committed batch blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
	pub simulation_run_id: RunId,
	pub storage_key: String,
	pub tick_start: i64,
	pub tick_end: i64,
	pub written_at_ms: i64,
}

impl BatchInfo {
	pub const TYPE_URL: &'static str = "sim.v1.BatchInfo";
}

/// Topic payload announcing a committed metadata blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataInfo {
	pub simulation_run_id: RunId,
	pub storage_key: String,
	pub written_at_ms: i64,
}

impl MetadataInfo {
	pub const TYPE_URL: &'static str = "sim.v1.MetadataInfo";
}

/// Per-run environment description. The only legal source of environment
/// shape, topology and dimension count for an indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
	pub simulation_run_id: RunId,
	/// Extent of the environment per dimension; `len()` is the dimension count.
	pub dimensions: Vec<i64>,
	/// e.g. "torus", "bounded". Opaque to the pipeline.
	pub topology: String,
}

/// One non-empty environment cell at a given tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
	pub position: Vec<i64>,
	pub value: i64,
	pub owner: Option<i64>,
}

/// The per-tick record stored in batch blobs: a tick number and its non-empty
/// cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
	pub tick: i64,
	pub cells: Vec<CellRecord>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_id_round_trips_through_display() {
		let run = RunId::generate();
		let parsed: RunId = run.to_string().parse().unwrap();
		assert_eq!(run, parsed);
	}

	#[test]
	fn run_id_rejects_garbage() {
		assert!("nope".parse::<RunId>().is_err());
		assert!("123".parse::<RunId>().is_err());
		assert!("abc-550e8400-e29b-41d4-a716-446655440000".parse::<RunId>().is_err());
		assert!("123-not-a-uuid".parse::<RunId>().is_err());
	}

	#[test]
	fn schema_name_is_sanitised() {
		let run: RunId = "1650000000000-550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
		let schema = run.schema_name();
		assert_eq!(schema, "sim_1650000000000_550e8400_e29b_41d4_a716_446655440000");
		assert!(schema.len() < 63);
		assert!(schema.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
	}

	#[test]
	fn batch_info_serde_round_trip() {
		let info = BatchInfo {
			simulation_run_id: RunId::generate(),
			storage_key: "r1/batch_0000000000000000000_0000000000000000099.pb".into(),
			tick_start: 0,
			tick_end: 99,
			written_at_ms: 1,
		};
		let json = serde_json::to_string(&info).unwrap();
		let back: BatchInfo = serde_json::from_str(&json).unwrap();
		assert_eq!(info, back);
	}
}
