// src/memory/mod.rs — Lineage database

pub mod artifacts;
pub mod schema;
pub mod store;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

use crate::infra::errors::{PipelineError, PipelineResult};
use crate::provider::retry::{CallAudit, CallRecord};
use store::{ApiCallRow, Store};

/// Store shared by the tasks of one orchestrator. Never held across an await.
pub type SharedStore = Arc<Mutex<Store>>;

/// Lock the shared store. A poisoned lock means a writer panicked mid-update.
pub fn lock(store: &SharedStore) -> PipelineResult<MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| PipelineError::Integrity("lineage store lock poisoned".into()))
}

/// Owner of the SQLite connection holding the lineage.
pub struct LineageDb {
    pub store: Store,
}

impl LineageDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        // WAL lets several worker processes read while one writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        schema::run_migrations(&conn)?;

        Ok(Self {
            store: Store::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            store: Store::new(conn),
        })
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self.store))
    }
}

/// Writes collaborator attempts to the `api_calls` table.
pub struct StoreAudit {
    store: SharedStore,
}

impl StoreAudit {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

impl CallAudit for StoreAudit {
    fn record(&self, call: &CallRecord) {
        let row = ApiCallRow {
            service: call.service.clone(),
            operation: call.operation.clone(),
            attempt: call.attempt,
            status: call.status.to_string(),
            error_kind: call.error_kind.map(String::from),
            error: call.error.clone(),
            duration_ms: call.duration_ms,
        };
        let result = match self.store.lock() {
            Ok(store) => store.insert_api_call(&row),
            Err(_) => return,
        };
        if let Err(e) = result {
            warn!(service = %call.service, "Failed to record API call: {e}");
        }
    }
}
