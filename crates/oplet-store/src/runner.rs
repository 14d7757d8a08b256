//! Runner registry and embedded-runner provisioning.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::entities::Runner;
use crate::error::StoreError;
use crate::store::{dt_to_ms, ms_to_dt, Store};
use crate::token::{random_token, RUNNER_TOKEN_BYTES};

/// Name of the coordinator's default in-process worker.
pub const EMBEDDED_RUNNER_NAME: &str = "Embedded Runner";

const RUNNER_COLUMNS: &str = "id, name, token, contacted_at_ms, created_at_ms";

#[derive(Clone)]
pub struct RunnerRepository {
    store: Store,
}

impl RunnerRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Registers a runner under `name` with a freshly generated token.
    pub fn create(&self, name: &str) -> Result<Runner, StoreError> {
        let token = random_token(RUNNER_TOKEN_BYTES);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runners (name, token, created_at_ms) VALUES (?1, ?2, ?3)",
                params![name, token, dt_to_ms(Utc::now())],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?1"),
                params![id],
                map_runner,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_by_token(&self, token: &str) -> Result<Runner, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE token = ?1"),
                params![token],
                map_runner,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Runner, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE name = ?1"),
                params![name],
                map_runner,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn list(&self) -> Result<Vec<Runner>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUNNER_COLUMNS} FROM runners ORDER BY created_at_ms DESC"
            ))?;
            let rows = stmt.query_map([], map_runner)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn update_contacted_at(
        &self,
        id: i64,
        contacted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runners SET contacted_at_ms = ?2 WHERE id = ?1",
                params![id, dt_to_ms(contacted_at)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn regenerate_token(&self, id: i64) -> Result<String, StoreError> {
        let token = random_token(RUNNER_TOKEN_BYTES);
        self.store.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE runners SET token = ?2 WHERE id = ?1",
                params![id, token],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(token.clone())
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM runners WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Returns the embedded runner, creating it with a generated token on
    /// first start. The token is persisted and stable across restarts.
    pub fn ensure_embedded(&self) -> Result<Runner, StoreError> {
        self.store.with_tx(|tx| {
            let existing = tx
                .query_row(
                    &format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE name = ?1"),
                    params![EMBEDDED_RUNNER_NAME],
                    map_runner,
                )
                .optional()?;
            if let Some(runner) = existing {
                return Ok(runner);
            }

            let token = random_token(RUNNER_TOKEN_BYTES);
            tx.execute(
                "INSERT INTO runners (name, token, created_at_ms) VALUES (?1, ?2, ?3)",
                params![EMBEDDED_RUNNER_NAME, token, dt_to_ms(Utc::now())],
            )?;
            let id = tx.last_insert_rowid();
            tx.query_row(
                &format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?1"),
                params![id],
                map_runner,
            )
            .map_err(StoreError::from)
        })
    }
}

fn map_runner(row: &Row<'_>) -> Result<Runner, rusqlite::Error> {
    Ok(Runner {
        id: row.get(0)?,
        name: row.get(1)?,
        token: row.get(2)?,
        contacted_at: row.get::<_, Option<i64>>(3)?.map(ms_to_dt),
        created_at: ms_to_dt(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_embedded_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let runners = RunnerRepository::new(store);
        let first = runners.ensure_embedded().unwrap();
        let second = runners.ensure_embedded().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.token, second.token);
        assert_eq!(first.name, EMBEDDED_RUNNER_NAME);
    }

    #[test]
    fn token_lookup_and_contact_stamp() {
        let store = Store::open_in_memory().unwrap();
        let runners = RunnerRepository::new(store);
        let created = runners.create("bench-runner").unwrap();

        let fetched = runners.get_by_token(&created.token).unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(fetched.contacted_at.is_none());

        runners.update_contacted_at(created.id, Utc::now()).unwrap();
        let fetched = runners.get_by_name("bench-runner").unwrap();
        assert!(fetched.contacted_at.is_some());
    }

    #[test]
    fn unknown_token_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let runners = RunnerRepository::new(store);
        assert!(matches!(
            runners.get_by_token("deadbeef"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn regenerate_token_invalidates_the_old_one() {
        let store = Store::open_in_memory().unwrap();
        let runners = RunnerRepository::new(store);
        let created = runners.create("bench-runner").unwrap();
        let fresh = runners.regenerate_token(created.id).unwrap();
        assert_ne!(fresh, created.token);
        assert!(matches!(
            runners.get_by_token(&created.token),
            Err(StoreError::NotFound)
        ));
        assert_eq!(runners.get_by_token(&fresh).unwrap().id, created.id);
    }
}
