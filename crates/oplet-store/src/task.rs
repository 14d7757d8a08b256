//! Task template repository.

use chrono::Utc;
use rusqlite::{params, Row, Transaction};

use crate::entities::{NewTask, Task, TaskConfiguration};
use crate::error::StoreError;
use crate::store::{dt_to_ms, ms_to_dt, Store};

#[derive(Clone)]
pub struct TaskRepository {
    store: Store,
}

impl TaskRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Creates a task with its configuration pairs in one transaction.
    pub fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tasks (image_ref, name, author, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.image_ref,
                    new.name,
                    new.author,
                    new.description,
                    dt_to_ms(Utc::now()),
                ],
            )?;
            let id = tx.last_insert_rowid();
            for config in &new.configurations {
                tx.execute(
                    "INSERT INTO task_configurations (task_id, name, value) VALUES (?1, ?2, ?3)",
                    params![id, config.name, config.value],
                )?;
            }
            get_in_tx(tx, id)
        })
    }

    pub fn get(&self, id: i64) -> Result<Task, StoreError> {
        self.store.with_tx(|tx| get_in_tx(tx, id))
    }

    pub fn get_by_image_ref(&self, image_ref: &str) -> Result<Task, StoreError> {
        self.store.with_tx(|tx| {
            let id: i64 = tx.query_row(
                "SELECT id FROM tasks WHERE image_ref = ?1",
                params![image_ref],
                |row| row.get(0),
            )?;
            get_in_tx(tx, id)
        })
    }

    pub fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id FROM tasks ORDER BY created_at_ms DESC",
            )?;
            let ids: Vec<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            ids.into_iter().map(|id| get_in_tx(tx, id)).collect()
        })
    }

    /// Deletes a task. Child executions (with their logs and file records)
    /// go with it via the cascading foreign keys.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }
}

fn get_in_tx(tx: &Transaction, id: i64) -> Result<Task, StoreError> {
    let mut task = tx.query_row(
        "SELECT id, image_ref, name, author, description, created_at_ms
         FROM tasks WHERE id = ?1",
        params![id],
        map_task,
    )?;
    let mut stmt = tx.prepare(
        "SELECT name, value FROM task_configurations WHERE task_id = ?1 ORDER BY name ASC",
    )?;
    let configs = stmt.query_map(params![id], |row| {
        Ok(TaskConfiguration {
            name: row.get(0)?,
            value: row.get(1)?,
        })
    })?;
    for config in configs {
        task.configurations.push(config?);
    }
    Ok(task)
}

fn map_task(row: &Row<'_>) -> Result<Task, rusqlite::Error> {
    Ok(Task {
        id: row.get(0)?,
        image_ref: row.get(1)?,
        name: row.get(2)?,
        author: row.get(3)?,
        description: row.get(4)?,
        created_at: ms_to_dt(row.get(5)?),
        configurations: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewTaskExecution;
    use crate::execution::ExecutionRepository;

    #[test]
    fn create_and_fetch_with_configuration() {
        let store = Store::open_in_memory().unwrap();
        let tasks = TaskRepository::new(store);
        let created = tasks
            .create(NewTask {
                image_ref: "registry/example/hello:latest".into(),
                name: "hello".into(),
                author: "ops".into(),
                description: "prints a greeting".into(),
                configurations: vec![TaskConfiguration {
                    name: "LOG_LEVEL".into(),
                    value: "debug".into(),
                }],
            })
            .unwrap();

        let fetched = tasks.get_by_image_ref("registry/example/hello:latest").unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.configurations.len(), 1);
        assert_eq!(fetched.configurations[0].name, "LOG_LEVEL");
    }

    #[test]
    fn image_ref_is_unique() {
        let store = Store::open_in_memory().unwrap();
        let tasks = TaskRepository::new(store);
        let new = NewTask {
            image_ref: "registry/example/hello:latest".into(),
            name: "hello".into(),
            ..Default::default()
        };
        tasks.create(new.clone()).unwrap();
        assert!(matches!(tasks.create(new), Err(StoreError::Constraint(_))));
    }

    #[test]
    fn delete_cascades_to_executions() {
        let store = Store::open_in_memory().unwrap();
        let tasks = TaskRepository::new(store.clone());
        let executions = ExecutionRepository::new(store);
        let task = tasks
            .create(NewTask {
                image_ref: "registry/example/hello:latest".into(),
                name: "hello".into(),
                ..Default::default()
            })
            .unwrap();
        let exec = executions
            .create(NewTaskExecution {
                task_id: task.id,
                ..Default::default()
            })
            .unwrap();

        tasks.delete(task.id).unwrap();
        assert!(matches!(executions.get(exec.id), Err(StoreError::NotFound)));
    }
}
