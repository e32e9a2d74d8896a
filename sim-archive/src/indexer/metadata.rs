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

//! The metadata indexer sink: single-record metadata blobs upserted into the
//! run schema's key/value table.

use async_trait::async_trait;

use sim_archive_common::{MetadataInfo, RunId, RunMetadata};

use crate::{database::MetaWriter, error::Result, indexer::batch::TickSink};

pub struct MetadataSink {
	meta: MetaWriter,
}

impl MetadataSink {
	pub fn new(meta: MetaWriter) -> Self {
		Self { meta }
	}
}

#[async_trait]
impl TickSink for MetadataSink {
	type Notice = MetadataInfo;
	type Record = RunMetadata;

	const NOTICE_TYPE_URL: &'static str = MetadataInfo::TYPE_URL;

	fn storage_key(notice: &MetadataInfo) -> &str {
		&notice.storage_key
	}

	fn notice_run(notice: &MetadataInfo) -> &RunId {
		&notice.simulation_run_id
	}

	fn needs_metadata(&self) -> bool {
		false
	}

	async fn prepare(&mut self, run: &RunId, _metadata: Option<&RunMetadata>) -> Result<()> {
		self.meta.set_run(run).await?;
		self.meta.create_metadata_table().await?;
		Ok(())
	}

	async fn flush(&mut self, records: &[RunMetadata]) -> Result<u64> {
		for record in records {
			self.meta.write_run_metadata(record).await?;
		}
		Ok(records.len() as u64)
	}
}
