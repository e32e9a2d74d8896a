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

//! Shared plumbing for tests that touch a live Postgres. Such tests read
//! `TEST_DATABASE_URL` and return early when it is unset, so the suite stays
//! green on machines without a database.

use std::sync::{Mutex, MutexGuard};

use async_std::task;
use once_cell::sync::Lazy;
use sqlx::{postgres::PgConnection, Connection, Executor};

static TEST_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// `TEST_DATABASE_URL`, if the environment provides one.
pub fn database_url() -> Option<String> {
	std::env::var("TEST_DATABASE_URL").ok()
}

/// Serialises database tests and wipes broker/indexer state on drop, so every
/// test starts from clean tables.
pub struct TestGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl<'a> TestGuard<'a> {
	pub fn lock() -> Self {
		TestGuard(TEST_MUTEX.lock().expect("Test mutex panicked"))
	}
}

impl<'a> Drop for TestGuard<'a> {
	fn drop(&mut self) {
		let url = match database_url() {
			Some(url) => url,
			None => return,
		};
		task::block_on(async move {
			let mut conn = match PgConnection::connect(&url).await {
				Ok(conn) => conn,
				Err(_) => return,
			};
			// Tables may not exist yet on a pristine database.
			let _ = conn
				.execute(
					"
					TRUNCATE TABLE topic_messages RESTART IDENTITY;
					TRUNCATE TABLE topic_acks;
					",
				)
				.await;
			let _ = drop_run_schemas(&mut conn).await;
		});
	}
}

/// Drop every per-run schema (`sim_*`) left behind by indexer tests.
async fn drop_run_schemas(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
	use sqlx::Row;
	let rows = sqlx::query("SELECT nspname FROM pg_namespace WHERE nspname LIKE 'sim\\_%'").fetch_all(&mut *conn).await?;
	for row in rows {
		let name: String = row.try_get("nspname")?;
		conn.execute(format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", name).as_str()).await?;
	}
	Ok(())
}
