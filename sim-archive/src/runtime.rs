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

//! Wiring from a declarative configuration tree to live resources and
//! services. Factories are a plain registry keyed by string kind; a service's
//! `resources` map binds names to `usageType:resourceName?k=v` URIs.

use std::{collections::BTreeMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
	database::{Database, DatabaseConfig},
	error::{ArchiveError, Result},
	indexer::{BatchIndexer, EnvSink, IndexerConfig, MetadataSink},
	queue::{MemoryQueue, QueueConfig},
	resource::{Registry, Resource, UsageContext, UsageType, Wrapped},
	service::{Service, ServiceState, Worker},
	storage::{FileStore, StorageConfig},
	topic::TopicResource,
};

use sim_broker::BrokerConfig;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub resources: BTreeMap<String, ResourceEntry>,
	#[serde(default)]
	pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResourceEntry {
	pub kind: String,
	#[serde(default)]
	pub options: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceEntry {
	pub kind: String,
	#[serde(default)]
	pub options: serde_json::Value,
	/// binding name -> `usageType:resourceName?k=v[&k=v...]`
	#[serde(default)]
	pub resources: BTreeMap<String, String>,
	#[serde(default = "default_stop_timeout_ms")]
	pub stop_timeout_ms: u64,
}

const fn default_stop_timeout_ms() -> u64 {
	10_000
}

/// A parsed resource URI.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
	pub usage: UsageType,
	pub resource: String,
	pub params: BTreeMap<String, String>,
}

impl ResourceSpec {
	pub fn context(&self, service: &str) -> UsageContext {
		let mut ctx = UsageContext::new(service, self.usage);
		ctx.parameters = self.params.clone();
		ctx
	}
}

impl FromStr for ResourceSpec {
	type Err = ArchiveError;

	fn from_str(s: &str) -> Result<Self> {
		let (scheme, rest) =
			s.split_once(':').ok_or_else(|| ArchiveError::Config(format!("resource uri `{}` has no usage type", s)))?;
		let usage = scheme.parse()?;
		let (resource, query) = match rest.split_once('?') {
			Some((resource, query)) => (resource, query),
			None => (rest, ""),
		};
		if resource.is_empty() {
			return Err(ArchiveError::Config(format!("resource uri `{}` names no resource", s)));
		}
		let mut params = BTreeMap::new();
		for pair in query.split('&').filter(|p| !p.is_empty()) {
			let (key, value) = pair
				.split_once('=')
				.ok_or_else(|| ArchiveError::Config(format!("resource uri `{}`: bad parameter `{}`", s, pair)))?;
			params.insert(key.to_string(), value.to_string());
		}
		Ok(Self { usage, resource: resource.to_string(), params })
	}
}

fn options_or_default<T: serde::de::DeserializeOwned + Default>(options: serde_json::Value) -> Result<T> {
	if options.is_null() {
		return Ok(T::default());
	}
	serde_json::from_value(options).map_err(|e| ArchiveError::Config(format!("bad options: {}", e)))
}

fn options_required<T: serde::de::DeserializeOwned>(options: serde_json::Value) -> Result<T> {
	serde_json::from_value(options).map_err(|e| ArchiveError::Config(format!("bad options: {}", e)))
}

/// `(name, options) -> Resource`, looked up by string kind. The run-time
/// replacement for loading implementation classes by name.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
	fn kind(&self) -> &'static str;
	async fn build(&self, name: &str, options: serde_json::Value) -> Result<Arc<dyn Resource>>;
}

struct TopicFactory;

#[async_trait]
impl ResourceFactory for TopicFactory {
	fn kind(&self) -> &'static str {
		"topic"
	}

	async fn build(&self, name: &str, options: serde_json::Value) -> Result<Arc<dyn Resource>> {
		let config: BrokerConfig = options_required(options)?;
		Ok(Arc::new(TopicResource::open(name, config).await?))
	}
}

struct StorageFactory;

#[async_trait]
impl ResourceFactory for StorageFactory {
	fn kind(&self) -> &'static str {
		"file-storage"
	}

	async fn build(&self, name: &str, options: serde_json::Value) -> Result<Arc<dyn Resource>> {
		let config: StorageConfig = options_required(options)?;
		Ok(Arc::new(FileStore::open(name, config)?))
	}
}

struct DatabaseFactory;

#[async_trait]
impl ResourceFactory for DatabaseFactory {
	fn kind(&self) -> &'static str {
		"database"
	}

	async fn build(&self, name: &str, options: serde_json::Value) -> Result<Arc<dyn Resource>> {
		let config: DatabaseConfig = options_required(options)?;
		Ok(Arc::new(Database::connect(name, config).await?))
	}
}

struct QueueFactory;

#[async_trait]
impl ResourceFactory for QueueFactory {
	fn kind(&self) -> &'static str {
		"memory-queue"
	}

	async fn build(&self, name: &str, options: serde_json::Value) -> Result<Arc<dyn Resource>> {
		let config: QueueConfig = options_or_default(options)?;
		Ok(Arc::new(MemoryQueue::new(name, config)))
	}
}

/// The wrapped resources resolved for one service, keyed by binding name.
pub struct ResolvedResources {
	map: BTreeMap<String, Wrapped>,
}

impl ResolvedResources {
	pub fn new() -> Self {
		Self { map: BTreeMap::new() }
	}

	pub fn insert(&mut self, binding: impl Into<String>, wrapped: Wrapped) {
		self.map.insert(binding.into(), wrapped);
	}

	pub fn take(&mut self, binding: &str) -> Result<Wrapped> {
		self.map
			.remove(binding)
			.ok_or_else(|| ArchiveError::Config(format!("service is missing resource binding `{}`", binding)))
	}
}

impl Default for ResolvedResources {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
pub trait ServiceFactory: Send + Sync {
	fn kind(&self) -> &'static str;
	async fn build(
		&self,
		name: &str,
		options: serde_json::Value,
		resources: &mut ResolvedResources,
	) -> Result<Box<dyn Worker>>;
}

struct EnvIndexerFactory;

#[async_trait]
impl ServiceFactory for EnvIndexerFactory {
	fn kind(&self) -> &'static str {
		"env-indexer"
	}

	async fn build(
		&self,
		_name: &str,
		options: serde_json::Value,
		resources: &mut ResolvedResources,
	) -> Result<Box<dyn Worker>> {
		let config: IndexerConfig = options_or_default(options)?;
		let subscriber = resources.take("topic")?.into_subscriber()?;
		let storage = resources.take("storage")?.into_storage_reader()?;
		let env = resources.take("db")?.into_env_writer()?;
		Ok(Box::new(BatchIndexer::new(subscriber, storage, EnvSink::new(env), config)))
	}
}

struct MetadataIndexerFactory;

#[async_trait]
impl ServiceFactory for MetadataIndexerFactory {
	fn kind(&self) -> &'static str {
		"metadata-indexer"
	}

	async fn build(
		&self,
		_name: &str,
		options: serde_json::Value,
		resources: &mut ResolvedResources,
	) -> Result<Box<dyn Worker>> {
		let config: IndexerConfig = options_or_default(options)?;
		let subscriber = resources.take("topic")?.into_subscriber()?;
		let storage = resources.take("storage")?.into_storage_reader()?;
		let meta = resources.take("db")?.into_meta_writer()?;
		Ok(Box::new(BatchIndexer::new(subscriber, storage, MetadataSink::new(meta), config)))
	}
}

pub fn default_resource_factories() -> Vec<Box<dyn ResourceFactory>> {
	vec![Box::new(TopicFactory), Box::new(StorageFactory), Box::new(DatabaseFactory), Box::new(QueueFactory)]
}

pub fn default_service_factories() -> Vec<Box<dyn ServiceFactory>> {
	vec![Box::new(EnvIndexerFactory), Box::new(MetadataIndexerFactory)]
}

/// All resources and services of one process, wired from configuration.
pub struct Runtime {
	registry: Arc<Registry>,
	services: BTreeMap<String, Service>,
}

impl Runtime {
	pub async fn build(config: Config) -> Result<Self> {
		Self::build_with(config, default_resource_factories(), default_service_factories()).await
	}

	pub async fn build_with(
		config: Config,
		resource_factories: Vec<Box<dyn ResourceFactory>>,
		service_factories: Vec<Box<dyn ServiceFactory>>,
	) -> Result<Self> {
		let registry = Arc::new(Registry::new());

		for (name, entry) in &config.resources {
			let factory = resource_factories
				.iter()
				.find(|f| f.kind() == entry.kind)
				.ok_or_else(|| ArchiveError::UnknownFactory(entry.kind.clone()))?;
			let resource = factory.build(name, entry.options.clone()).await?;
			registry.insert(resource)?;
		}

		let mut services = BTreeMap::new();
		for (name, entry) in &config.services {
			let factory = service_factories
				.iter()
				.find(|f| f.kind() == entry.kind)
				.ok_or_else(|| ArchiveError::UnknownFactory(entry.kind.clone()))?;
			let mut resolved = ResolvedResources::new();
			for (binding, uri) in &entry.resources {
				let spec: ResourceSpec = uri.parse()?;
				let wrapped = registry.wrap(&spec.resource, &spec.context(name)).await?;
				resolved.insert(binding.clone(), wrapped);
			}
			let worker = factory.build(name, entry.options.clone(), &mut resolved).await?;
			let service = Service::with_stop_timeout(name, worker, Duration::from_millis(entry.stop_timeout_ms));
			services.insert(name.clone(), service);
		}

		Ok(Self { registry, services })
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn service(&self, name: &str) -> Option<&Service> {
		self.services.get(name)
	}

	pub fn states(&self) -> BTreeMap<String, ServiceState> {
		self.services.iter().map(|(name, service)| (name.clone(), service.state())).collect()
	}

	pub fn start_all(&self) -> Result<()> {
		for service in self.services.values() {
			service.start()?;
		}
		Ok(())
	}

	pub fn stop_all(&self) {
		for service in self.services.values() {
			if let Err(e) = service.stop() {
				log::error!("{}", e);
			}
		}
	}

	/// Stop every service, then close every resource.
	pub async fn shutdown(self) {
		self.stop_all();
		self.registry.close_all().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_spec_parses_usage_name_and_params() {
		let spec: ResourceSpec = "topic-read:batches?consumer_group=indexers&metrics_window_seconds=30".parse().unwrap();
		assert_eq!(spec.usage, UsageType::TopicRead);
		assert_eq!(spec.resource, "batches");
		assert_eq!(spec.params.get("consumer_group").map(String::as_str), Some("indexers"));
		assert_eq!(spec.params.get("metrics_window_seconds").map(String::as_str), Some("30"));
	}

	#[test]
	fn resource_spec_without_params() {
		let spec: ResourceSpec = "storage-read:blobs".parse().unwrap();
		assert_eq!(spec.usage, UsageType::StorageRead);
		assert_eq!(spec.resource, "blobs");
		assert!(spec.params.is_empty());
	}

	#[test]
	fn bad_resource_specs_are_config_errors() {
		for uri in ["no-colon", "bogus-usage:x", "topic-read:", "topic-read:x?keyonly"] {
			assert!(uri.parse::<ResourceSpec>().is_err(), "uri `{}`", uri);
		}
	}

	#[test]
	fn config_tree_deserializes() {
		let json = serde_json::json!({
			"resources": {
				"batches": { "kind": "topic", "options": { "db_url": "postgres://localhost/sim" } },
				"blobs": { "kind": "file-storage", "options": { "root_directory": "/var/lib/sim" } },
			},
			"services": {
				"env-indexer-1": {
					"kind": "env-indexer",
					"options": { "insert_batch_size": 500 },
					"resources": {
						"topic": "topic-read:batches?consumer_group=env",
						"storage": "storage-read:blobs",
						"db": "db-env-write:simdb"
					}
				}
			}
		});
		let config: Config = serde_json::from_value(json).unwrap();
		assert_eq!(config.resources.len(), 2);
		let service = &config.services["env-indexer-1"];
		assert_eq!(service.kind, "env-indexer");
		assert_eq!(service.stop_timeout_ms, 10_000);
		assert_eq!(service.resources.len(), 3);
	}

	#[test]
	fn unknown_factory_kind_fails_the_build() {
		let json = serde_json::json!({
			"resources": { "x": { "kind": "quantum-store" } },
		});
		let config: Config = serde_json::from_value(json).unwrap();
		let err = match async_std::task::block_on(Runtime::build(config)) {
			Ok(_) => panic!("expected an error"),
			Err(e) => e,
		};
		assert!(matches!(err, ArchiveError::UnknownFactory(_)));
	}
}
