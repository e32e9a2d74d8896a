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

//! Types, metrics and error plumbing shared between the broker and the
//! archive crates.

#![forbid(unsafe_code)]

pub mod errlog;
pub mod error;
pub mod metrics;
pub mod types;
pub mod util;

pub use self::{
	errlog::{ErrorEntry, ErrorLog},
	error::ErrorKind,
	metrics::{Counter, MetricValue, Metrics, SlidingHistogram, SlidingRate},
	types::{BatchInfo, CellRecord, MetadataInfo, RunId, RunMetadata, TickData},
};
