//! Async handle over the synchronous [`Database`].
//!
//! `rusqlite` blocks, so every call is moved onto tokio's blocking pool. The
//! connection itself sits behind a `std::sync::Mutex`; SQLite serialises
//! writers anyway and the lock is never held across an `.await`.

use std::sync::{Arc, Mutex, PoisonError};

use parlor_store::{Database, Result, StoreError};

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// In-memory database, used by tests and throwaway instances.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            // A panic inside an earlier call leaves the connection usable;
            // SQLite rolls back the open transaction on drop.
            let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
