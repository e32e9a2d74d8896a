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

//! A durable topic broker on Postgres.
//!
//! Messages are rows; claims are row updates behind `FOR UPDATE SKIP LOCKED`;
//! acknowledgements are per-consumer-group insert-only rows. An insert
//! trigger raises a NOTIFY that a per-process listener fans out to in-memory
//! subscriber buffers, so readers are event-driven with a bounded fallback
//! recheck. Delivery is at-least-once; rows are never deleted.

#![forbid(unsafe_code)]

mod broker;
mod envelope;
mod error;
mod listener;
mod publisher;
mod subscriber;

pub use self::{
	broker::{Broker, BrokerConfig},
	envelope::{AnyPayload, Envelope},
	error::{BrokerError, Result},
	listener::{Listener, Notif, Router, NOTIFY_CHANNEL},
	publisher::Publisher,
	subscriber::{Delivery, Subscriber},
};
