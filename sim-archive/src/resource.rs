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

//! The resource model: named, long-lived collaborators (topics, blob stores,
//! databases, in-memory queues) owned by a process-wide [`Registry`] and used
//! through per-service capability wrappers.
//!
//! A wrapper owns its per-consumer state (dedicated connection, consumer
//! group, metrics) and is released when the consuming service shuts down.
//! Resources track live wrappers weakly and complain about leaks when they
//! close.

use std::{
	collections::BTreeMap,
	fmt,
	str::FromStr,
	sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{
	database::{EnvWriter, MetaReader, MetaWriter},
	error::{ArchiveError, Result},
	queue::{QueueIn, QueueOut},
	storage::{StorageReader, StorageWriter},
	topic::{TopicPublisher, TopicSubscriber},
};

/// The capability slice a wrap request selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageType {
	TopicRead,
	TopicWrite,
	StorageRead,
	StorageWrite,
	DbMetaRead,
	DbMetaWrite,
	DbEnvWrite,
	QueueIn,
	QueueOut,
}

impl UsageType {
	pub fn as_str(&self) -> &'static str {
		match self {
			UsageType::TopicRead => "topic-read",
			UsageType::TopicWrite => "topic-write",
			UsageType::StorageRead => "storage-read",
			UsageType::StorageWrite => "storage-write",
			UsageType::DbMetaRead => "db-meta-read",
			UsageType::DbMetaWrite => "db-meta-write",
			UsageType::DbEnvWrite => "db-env-write",
			UsageType::QueueIn => "queue-in",
			UsageType::QueueOut => "queue-out",
		}
	}
}

impl fmt::Display for UsageType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for UsageType {
	type Err = ArchiveError;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"topic-read" => UsageType::TopicRead,
			"topic-write" => UsageType::TopicWrite,
			"storage-read" => UsageType::StorageRead,
			"storage-write" => UsageType::StorageWrite,
			"db-meta-read" => UsageType::DbMetaRead,
			"db-meta-write" => UsageType::DbMetaWrite,
			"db-env-write" => UsageType::DbEnvWrite,
			"queue-in" => UsageType::QueueIn,
			"queue-out" => UsageType::QueueOut,
			other => return Err(ArchiveError::Config(format!("unknown usage type `{}`", other))),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageState {
	Active,
	Draining,
	Closed,
}

/// Who is asking for a wrapper, and with which per-wrapper parameters.
#[derive(Debug, Clone)]
pub struct UsageContext {
	pub service_name: String,
	pub usage: UsageType,
	pub parameters: BTreeMap<String, String>,
}

impl UsageContext {
	pub fn new(service_name: impl Into<String>, usage: UsageType) -> Self {
		Self { service_name: service_name.into(), usage, parameters: BTreeMap::new() }
	}

	pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.parameters.insert(key.into(), value.into());
		self
	}

	pub fn param(&self, key: &str) -> Option<&str> {
		self.parameters.get(key).map(String::as_str)
	}

	pub fn require_param(&self, key: &str) -> Result<&str> {
		self.param(key).ok_or_else(|| {
			ArchiveError::Config(format!("usage `{}` requires parameter `{}`", self.usage, key))
		})
	}
}

/// The typed handle a service actually uses, returned by [`Resource::wrap`].
pub enum Wrapped {
	Publisher(TopicPublisher),
	Subscriber(TopicSubscriber),
	StorageReader(StorageReader),
	StorageWriter(StorageWriter),
	MetaReader(MetaReader),
	MetaWriter(MetaWriter),
	EnvWriter(EnvWriter),
	QueueIn(QueueIn),
	QueueOut(QueueOut),
}

macro_rules! unwrap_as {
	($fn_name:ident, $variant:ident, $ty:ty, $label:expr) => {
		pub fn $fn_name(self) -> Result<$ty> {
			match self {
				Wrapped::$variant(inner) => Ok(inner),
				_ => Err(ArchiveError::WrongCapability { expected: $label }),
			}
		}
	};
}

impl Wrapped {
	unwrap_as!(into_publisher, Publisher, TopicPublisher, "topic-write");
	unwrap_as!(into_subscriber, Subscriber, TopicSubscriber, "topic-read");
	unwrap_as!(into_storage_reader, StorageReader, StorageReader, "storage-read");
	unwrap_as!(into_storage_writer, StorageWriter, StorageWriter, "storage-write");
	unwrap_as!(into_meta_reader, MetaReader, MetaReader, "db-meta-read");
	unwrap_as!(into_meta_writer, MetaWriter, MetaWriter, "db-meta-write");
	unwrap_as!(into_env_writer, EnvWriter, EnvWriter, "db-env-write");
	unwrap_as!(into_queue_in, QueueIn, QueueIn, "queue-in");
	unwrap_as!(into_queue_out, QueueOut, QueueOut, "queue-out");
}

/// A named, long-lived, process-wide collaborator.
#[async_trait]
pub trait Resource: Send + Sync {
	fn name(&self) -> &str;
	fn kind(&self) -> &'static str;
	fn usage_state(&self, usage: UsageType) -> UsageState;

	/// Hand out the capability slice selected by the context's usage type.
	/// A usage the resource does not recognise is a configuration error.
	async fn wrap(&self, ctx: &UsageContext) -> Result<Wrapped>;

	async fn close(&self);
}

/// Identity of one live wrapper, held strongly by the wrapper and weakly by
/// its resource.
#[derive(Debug)]
pub struct WrapperTag {
	pub service: String,
	pub usage: UsageType,
}

/// Weak set of live wrappers per resource.
pub struct WrapperSet(Mutex<Vec<Weak<WrapperTag>>>);

impl WrapperSet {
	pub fn new() -> Self {
		Self(Mutex::new(Vec::new()))
	}

	pub fn track(&self, service: &str, usage: UsageType) -> Arc<WrapperTag> {
		let tag = Arc::new(WrapperTag { service: service.to_string(), usage });
		let mut set = self.0.lock();
		set.retain(|weak| weak.strong_count() > 0);
		set.push(Arc::downgrade(&tag));
		tag
	}

	/// Wrappers that have not been released yet.
	pub fn live(&self) -> Vec<Arc<WrapperTag>> {
		self.0.lock().iter().filter_map(Weak::upgrade).collect()
	}

	pub fn warn_leaked(&self, resource: &str) {
		for tag in self.live() {
			log::warn!("resource `{}` closing over a live `{}` wrapper held by `{}`", resource, tag.usage, tag.service);
		}
	}
}

impl Default for WrapperSet {
	fn default() -> Self {
		Self::new()
	}
}

/// Process singleton owning every resource by name.
pub struct Registry {
	resources: RwLock<BTreeMap<String, Arc<dyn Resource>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self { resources: RwLock::new(BTreeMap::new()) }
	}

	pub fn insert(&self, resource: Arc<dyn Resource>) -> Result<()> {
		let name = resource.name().to_string();
		let mut resources = self.resources.write();
		if resources.contains_key(&name) {
			return Err(ArchiveError::DuplicateResource(name));
		}
		resources.insert(name, resource);
		Ok(())
	}

	pub fn get(&self, name: &str) -> Result<Arc<dyn Resource>> {
		self.resources.read().get(name).cloned().ok_or_else(|| ArchiveError::MissingResource(name.to_string()))
	}

	pub fn names(&self) -> Vec<String> {
		self.resources.read().keys().cloned().collect()
	}

	pub async fn wrap(&self, resource: &str, ctx: &UsageContext) -> Result<Wrapped> {
		self.get(resource)?.wrap(ctx).await
	}

	/// Close every resource. Services must already be stopped; leaked
	/// wrappers are logged by each resource.
	pub async fn close_all(&self) {
		let resources: Vec<Arc<dyn Resource>> = self.resources.read().values().cloned().collect();
		for resource in resources {
			resource.close().await;
		}
		self.resources.write().clear();
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn usage_type_round_trips() {
		for usage in [
			UsageType::TopicRead,
			UsageType::TopicWrite,
			UsageType::StorageRead,
			UsageType::StorageWrite,
			UsageType::DbMetaRead,
			UsageType::DbMetaWrite,
			UsageType::DbEnvWrite,
			UsageType::QueueIn,
			UsageType::QueueOut,
		] {
			assert_eq!(usage.as_str().parse::<UsageType>().unwrap(), usage);
		}
		assert!("topic-admin".parse::<UsageType>().is_err());
	}

	#[test]
	fn wrapper_set_tracks_and_forgets() {
		let set = WrapperSet::new();
		let tag = set.track("indexer", UsageType::TopicRead);
		assert_eq!(set.live().len(), 1);
		drop(tag);
		assert!(set.live().is_empty());
	}

	#[test]
	fn context_parameters() {
		let ctx = UsageContext::new("indexer", UsageType::TopicRead).with_param("consumer_group", "g");
		assert_eq!(ctx.param("consumer_group"), Some("g"));
		assert!(ctx.require_param("missing").is_err());
	}
}
