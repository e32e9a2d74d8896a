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

//! The environment indexer sink: batch blobs of per-tick cell records,
//! merged into the run schema through the configured env storage strategy.

use async_trait::async_trait;

use sim_archive_common::{BatchInfo, RunId, RunMetadata, TickData};

use crate::{
	database::EnvWriter,
	error::{ArchiveError, Result},
	indexer::batch::TickSink,
};

pub struct EnvSink {
	env: EnvWriter,
}

impl EnvSink {
	pub fn new(env: EnvWriter) -> Self {
		Self { env }
	}

	pub fn env(&self) -> &EnvWriter {
		&self.env
	}
}

#[async_trait]
impl TickSink for EnvSink {
	type Notice = BatchInfo;
	type Record = TickData;

	const NOTICE_TYPE_URL: &'static str = BatchInfo::TYPE_URL;

	fn storage_key(notice: &BatchInfo) -> &str {
		&notice.storage_key
	}

	fn notice_run(notice: &BatchInfo) -> &RunId {
		&notice.simulation_run_id
	}

	fn needs_metadata(&self) -> bool {
		true
	}

	async fn prepare(&mut self, run: &RunId, metadata: Option<&RunMetadata>) -> Result<()> {
		let metadata = metadata.ok_or(ArchiveError::MissingMetadata)?;
		self.env.set_run(run).await?;
		self.env.create_env_table(&metadata.dimensions).await?;
		Ok(())
	}

	async fn flush(&mut self, records: &[TickData]) -> Result<u64> {
		self.env.write_ticks(records).await
	}
}
