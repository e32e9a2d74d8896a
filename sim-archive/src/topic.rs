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

//! Resource-model adapter over the durable broker. One resource per topic
//! name; the broker's own wrappers are re-tagged so the registry can track
//! them like every other capability slice.

use std::{
	ops::{Deref, DerefMut},
	sync::Arc,
};

use async_trait::async_trait;

use sim_broker::{Broker, BrokerConfig, Publisher, Subscriber};

use crate::{
	error::{ArchiveError, Result},
	resource::{Resource, UsageContext, UsageState, UsageType, Wrapped, WrapperSet, WrapperTag},
};

pub struct TopicResource {
	broker: Broker,
	wrappers: WrapperSet,
}

impl TopicResource {
	/// Open the topic named `name` on the configured database.
	pub async fn open(name: &str, config: BrokerConfig) -> Result<Self> {
		let broker = Broker::open(name, config).await?;
		Ok(Self { broker, wrappers: WrapperSet::new() })
	}

	pub fn broker(&self) -> &Broker {
		&self.broker
	}
}

#[async_trait]
impl Resource for TopicResource {
	fn name(&self) -> &str {
		self.broker.topic()
	}

	fn kind(&self) -> &'static str {
		"topic"
	}

	fn usage_state(&self, _usage: UsageType) -> UsageState {
		if self.broker.is_closed() {
			UsageState::Closed
		} else {
			UsageState::Active
		}
	}

	async fn wrap(&self, ctx: &UsageContext) -> Result<Wrapped> {
		match ctx.usage {
			UsageType::TopicWrite => {
				let inner = self.broker.publisher(&ctx.service_name)?;
				let tag = self.wrappers.track(&ctx.service_name, ctx.usage);
				Ok(Wrapped::Publisher(TopicPublisher { inner, _tag: tag }))
			}
			UsageType::TopicRead => {
				let group = ctx.require_param("consumer_group")?;
				let inner = self.broker.subscriber(&ctx.service_name, group).await?;
				let tag = self.wrappers.track(&ctx.service_name, ctx.usage);
				Ok(Wrapped::Subscriber(TopicSubscriber { inner, _tag: tag }))
			}
			usage => {
				Err(ArchiveError::UnknownUsage { resource: self.broker.topic().to_string(), usage: usage.to_string() })
			}
		}
	}

	async fn close(&self) {
		self.broker.close().await;
		self.wrappers.warn_leaked(self.broker.topic());
	}
}

pub struct TopicPublisher {
	inner: Publisher,
	_tag: Arc<WrapperTag>,
}

impl Deref for TopicPublisher {
	type Target = Publisher;

	fn deref(&self) -> &Publisher {
		&self.inner
	}
}

pub struct TopicSubscriber {
	inner: Subscriber,
	_tag: Arc<WrapperTag>,
}

impl Deref for TopicSubscriber {
	type Target = Subscriber;

	fn deref(&self) -> &Subscriber {
		&self.inner
	}
}

impl DerefMut for TopicSubscriber {
	fn deref_mut(&mut self) -> &mut Subscriber {
		&mut self.inner
	}
}
