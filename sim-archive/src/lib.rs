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

//! The in-process data pipeline between a tick-based simulation producer and
//! its queryable database: blob store, per-run relational schemas, the
//! batch-indexer framework, and the service runtime wiring it all together.
//! The durable topic broker underneath lives in the `sim-broker` crate.

#![forbid(unsafe_code)]

pub mod database;
mod error;
pub mod indexer;
pub mod logger;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod service;
pub mod storage;
pub mod topic;

// Re-exports
pub use sim_archive_common::{BatchInfo, CellRecord, ErrorKind, MetadataInfo, RunId, RunMetadata, TickData};
pub use sim_broker::{Broker, BrokerConfig, Delivery, Envelope};

pub use self::{
	database::{Database, DatabaseConfig, EnvWriter, MetaReader, MetaWriter},
	error::{ArchiveError, Result},
	indexer::{BatchIndexer, EnvSink, IndexerConfig, MetadataSink, TickSink},
	queue::{MemoryQueue, QueueConfig},
	resource::{Registry, Resource, UsageContext, UsageState, UsageType, Wrapped},
	runtime::{Config, ResourceSpec, Runtime},
	service::{Service, ServiceContext, ServiceState, Worker},
	storage::{FileStore, StorageConfig, StorageError, StorageReader, StorageWriter},
	topic::{TopicPublisher, TopicResource, TopicSubscriber},
};
