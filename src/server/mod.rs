//! The top-level service process: task groups plus background routines
//!
//! A server owns every task group of one pipeline and the long-running
//! routines beside them (the rotation coordinator, periodic flushes). It runs
//! until SIGINT, then signals shutdown to every pump, worker and routine and
//! waits out a grace period before aborting stragglers.

use crate::group::GroupRunner;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

type Routine = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builder and event loop for one pipeline process.
pub struct Server {
    groups: Vec<Box<dyn GroupRunner>>,
    routines: Vec<(String, Routine)>,
    grace: Duration,
}

impl Server {
    pub fn new(grace: Duration) -> Self {
        Server {
            groups: Vec::new(),
            routines: Vec::new(),
            grace,
        }
    }

    /// Adds a task group. Groups start when `run` is called.
    pub fn add_group(&mut self, group: impl GroupRunner) {
        self.groups.push(Box::new(group));
    }

    /// Adds a named background routine (coordinator loop, periodic flush).
    /// Routines are expected to run until aborted.
    pub fn add_routine(
        &mut self,
        name: impl Into<String>,
        routine: impl Future<Output = ()> + Send + 'static,
    ) {
        self.routines.push((name.into(), Box::pin(routine)));
    }

    /// Runs until SIGINT.
    pub async fn run(self) -> crate::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = JoinSet::new();

        for group in self.groups {
            tracing::info!("starting group {}", group.group_name());
            group.start(&mut joins, shutdown_rx.clone());
        }
        for (name, routine) in self.routines {
            tracing::info!("starting routine {}", name);
            joins.spawn(routine);
        }

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested, draining");
        let _ = shutdown_tx.send(true);

        let drain = async {
            while joins.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            tracing::warn!("grace period elapsed, aborting remaining tasks");
            joins.shutdown().await;
        }
        Ok(())
    }
}
