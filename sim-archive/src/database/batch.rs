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

//! A method of dynamic multi-row statements with SQLx, used for the batched
//! upserts of the env storage strategies. Chunks keep each statement under
//! Postgres's bind-parameter ceiling; callers are expected to run the whole
//! batch inside one transaction.

use sqlx::{
	encode::Encode,
	postgres::{PgArguments, PgConnection, Postgres},
	Arguments, Type,
};

use crate::error::Result;

// Upper bound on bind arguments per statement. Postgres caps at 65535; a
// lower ceiling keeps single statements from ballooning on wide batches.
const CHUNK_MAX: usize = 5_000;

pub struct Chunk {
	query: String,
	arguments: PgArguments,
	args_len: usize,
}

impl Chunk {
	fn new(sql: &str) -> Self {
		let mut query = String::with_capacity(1024 * 8);
		query.push_str(sql);
		Self { query, arguments: PgArguments::default(), args_len: 0 }
	}

	pub fn append(&mut self, sql: &str) {
		self.query.push_str(sql);
	}

	pub fn bind<'a, T: 'a>(&mut self, value: T) -> Result<()>
	where
		T: Encode<'a, Postgres> + Type<Postgres> + Send,
	{
		self.arguments.add(value);
		self.query.push('$');
		itoa::fmt(&mut self.query, self.args_len + 1)?;
		self.args_len += 1;
		Ok(())
	}

	async fn execute(self, conn: &mut PgConnection) -> Result<u64> {
		let done = sqlx::query_with(&self.query, self.arguments).execute(conn).await?;
		Ok(done.rows_affected())
	}
}

pub struct Batch {
	#[allow(unused)]
	name: &'static str,
	leading: String,
	trailing: String,
	chunks: Vec<Chunk>,
	index: usize,
	len: usize,
}

impl Batch {
	pub fn new(name: &'static str, leading: &str, trailing: &str) -> Self {
		Self {
			name,
			leading: leading.to_owned(),
			trailing: trailing.to_owned(),
			chunks: vec![Chunk::new(leading)],
			index: 0,
			len: 0,
		}
	}

	/// Ensure there is enough room for N more arguments, rolling over to a
	/// fresh chunk when the current one is full.
	pub fn reserve(&mut self, arguments: usize) -> Result<()> {
		self.len += 1;
		if self.chunks[self.index].args_len + arguments > CHUNK_MAX {
			self.chunks.push(Chunk::new(&self.leading));
			self.index += 1;
		}
		Ok(())
	}

	pub fn append(&mut self, sql: &str) {
		self.chunks[self.index].append(sql);
	}

	pub fn bind<'a, T: 'a>(&mut self, value: T) -> Result<()>
	where
		T: Encode<'a, Postgres> + Type<Postgres> + Send,
	{
		self.chunks[self.index].bind(value)
	}

	pub fn current_num_arguments(&self) -> usize {
		self.chunks[self.index].args_len
	}

	pub async fn execute(self, conn: &mut PgConnection) -> Result<u64> {
		let mut rows_affected = 0;
		if self.len > 0 {
			for mut chunk in self.chunks {
				chunk.append(&self.trailing);
				let done = chunk.execute(&mut *conn).await?;
				rows_affected += done;
			}
		}
		Ok(rows_affected)
	}
}
