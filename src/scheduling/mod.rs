//! # Scheduling
//!
//! Writes, one-shot reads and live delivery run on separate executors so
//! that a slow live consumer cannot delay writes and a burst of writes
//! cannot starve notification delivery.
//!
//! `Schedulers` is a set of runtime handles. `WorkerPools` owns dedicated
//! runtimes sized from `RepositoryConfig`; tests usually share the current
//! runtime through `Schedulers::current()`.

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::config::RepositoryConfig;
use crate::errors::{RepoError, RepoResult};

/// Executors for the three kinds of work
#[derive(Debug, Clone)]
pub struct Schedulers {
    update: Handle,
    query: Handle,
    live: Handle,
}

impl Schedulers {
    pub fn new(update: Handle, query: Handle, live: Handle) -> Self {
        Self { update, query, live }
    }

    /// Run everything on the runtime of the caller
    pub fn current() -> RepoResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| RepoError::Config(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle.clone(), handle.clone(), handle))
    }

    /// Run a blocking write on the update pool
    pub async fn run_update<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce() -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.update.spawn_blocking(work).await?
    }

    /// Run a blocking read on the query pool
    pub async fn run_query<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce() -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.query.spawn_blocking(work).await?
    }

    /// Spawn a live pipeline task
    pub fn spawn_live<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.live.spawn(task)
    }

    pub fn live(&self) -> &Handle {
        &self.live
    }

    pub fn query(&self) -> &Handle {
        &self.query
    }
}

/// Dedicated runtimes backing a `Schedulers`
#[derive(Debug)]
pub struct WorkerPools {
    update: Option<Runtime>,
    query: Option<Runtime>,
    live: Option<Runtime>,
}

impl WorkerPools {
    /// Build one multi-threaded runtime per pool
    pub fn new(config: &RepositoryConfig) -> RepoResult<Self> {
        Ok(Self {
            update: Some(build_runtime("aerorepo-update", config.update_workers)?),
            query: Some(build_runtime("aerorepo-query", config.query_workers)?),
            live: Some(build_runtime("aerorepo-live", config.live_workers)?),
        })
    }

    /// Handles onto the pools
    pub fn schedulers(&self) -> RepoResult<Schedulers> {
        Ok(Schedulers::new(
            handle_of(&self.update)?,
            handle_of(&self.query)?,
            handle_of(&self.live)?,
        ))
    }
}

impl Drop for WorkerPools {
    fn drop(&mut self) {
        // Runtimes may be dropped from async code, which a blocking shutdown forbids
        for runtime in [self.update.take(), self.query.take(), self.live.take()]
            .into_iter()
            .flatten()
        {
            runtime.shutdown_background();
        }
    }
}

fn build_runtime(name: &str, workers: usize) -> RepoResult<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .max_blocking_threads(workers.max(1))
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(|e| RepoError::Config(format!("failed to start {} pool: {}", name, e)))
}

fn handle_of(runtime: &Option<Runtime>) -> RepoResult<Handle> {
    runtime
        .as_ref()
        .map(|r| r.handle().clone())
        .ok_or_else(|| RepoError::internal("worker pool already shut down"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_runs_blocking_work() {
        let schedulers = Schedulers::current().unwrap();
        let value = schedulers.run_query(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_errors_propagate_from_workers() {
        let schedulers = Schedulers::current().unwrap();
        let result: RepoResult<()> = schedulers
            .run_update(|| Err(RepoError::backend("disk full")))
            .await;
        assert_eq!(result, Err(RepoError::backend("disk full")));
    }

    #[test]
    fn test_current_requires_runtime() {
        assert!(matches!(Schedulers::current(), Err(RepoError::Config(_))));
    }

    #[tokio::test]
    async fn test_worker_pools_run_work() {
        let pools = WorkerPools::new(&RepositoryConfig::default()).unwrap();
        let schedulers = pools.schedulers().unwrap();

        let value = schedulers.run_update(|| Ok("stored")).await.unwrap();
        assert_eq!(value, "stored");

        let (tx, rx) = tokio::sync::oneshot::channel();
        schedulers.spawn_live(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
        drop(pools);
    }
}
