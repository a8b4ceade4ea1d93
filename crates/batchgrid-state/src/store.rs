//! StateStore — redb-backed persistence for jobs and clusters.
//!
//! All record values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing). Every write is its own transaction, so a crash never leaves a
//! partially written job or cluster behind.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Reserve the next job id. Ids start at 1 and never repeat.
    pub fn next_job_id(&self) -> StateResult<JobId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = table
                .get(JOB_ID_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            id = current + 1;
            table.insert(JOB_ID_SEQ, id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    /// Insert or update a job.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put_jobs(std::slice::from_ref(job))
    }

    /// Insert or update several jobs in one transaction.
    pub fn put_jobs(&self, jobs: &[Job]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for job in jobs {
                let key = job.table_key();
                let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = jobs.len(), "jobs stored");
        Ok(())
    }

    /// Get a job by id.
    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let key = job_key(id);
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: Job =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List all jobs in id order.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.scan_jobs(|_| true)
    }

    /// Jobs with the given status, optionally restricted to one cluster.
    pub fn jobs_with_status(
        &self,
        status: JobStatus,
        cluster: Option<&str>,
    ) -> StateResult<Vec<Job>> {
        self.scan_jobs(|job| {
            job.status == status
                && cluster.is_none_or(|name| job.cluster.as_deref() == Some(name))
        })
    }

    /// Jobs waiting to be scheduled.
    pub fn pending_jobs(&self) -> StateResult<Vec<Job>> {
        self.jobs_with_status(JobStatus::Pending, None)
    }

    /// Jobs currently running on `cluster`.
    pub fn running_jobs(&self, cluster: &str) -> StateResult<Vec<Job>> {
        self.jobs_with_status(JobStatus::Running, Some(cluster))
    }

    fn scan_jobs(&self, keep: impl Fn(&Job) -> bool) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&job) {
                results.push(job);
            }
        }
        Ok(results)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster record.
    pub fn put_cluster(&self, record: &ClusterRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = ?record.status, "cluster stored");
        Ok(())
    }

    /// Get a cluster record by name.
    pub fn get_cluster(&self, name: &str) -> StateResult<Option<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ClusterRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all cluster records.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ClusterRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a cluster record. Returns true if it existed.
    pub fn delete_cluster(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed, "cluster deleted");
        Ok(existed)
    }
}
