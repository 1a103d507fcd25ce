//! Rebalancer: reacts to ring changes by handing migration plans to an
//! executor, bounded by a deadline so a stuck migration cannot stall the
//! reaction loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::{RingManager, VirtualNodeAssignment};
use crate::error::{Result, TritonError};

pub const DEFAULT_REBALANCE_DEADLINE: Duration = Duration::from_secs(5);

/// Immutable snapshot handed to a migration executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub plan_id: String,
    pub ring_version: i64,
    #[serde(default)]
    pub assignments: Vec<VirtualNodeAssignment>,
}

/// Performs the data movement associated with a rebalance plan.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn execute_plan(&self, plan: &RebalancePlan) -> Result<()>;
}

/// Observe-only executor.
pub struct NoopMigrationExecutor;

#[async_trait]
impl MigrationExecutor for NoopMigrationExecutor {
    async fn execute_plan(&self, _plan: &RebalancePlan) -> Result<()> {
        Ok(())
    }
}

/// Watches ring changes and triggers data migrations.
pub struct Rebalancer {
    manager: Arc<RingManager>,
    executor: Arc<dyn MigrationExecutor>,
    deadline: Duration,
}

impl Rebalancer {
    pub fn new(
        manager: Arc<RingManager>,
        executor: Arc<dyn MigrationExecutor>,
        deadline: Duration,
    ) -> Self {
        let deadline = if deadline.is_zero() {
            DEFAULT_REBALANCE_DEADLINE
        } else {
            deadline
        };
        Self {
            manager,
            executor,
            deadline,
        }
    }

    /// Blocks until `shutdown` fires or the executor fails. Events observed
    /// while one execution is in flight queue up and run in order; no
    /// coalescing.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.manager.watch();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            let plan = RebalancePlan {
                plan_id: format!("rebalance-{}", event.version),
                ring_version: event.version,
                assignments: event.assignments,
            };

            tracing::info!(
                "executing rebalance plan {} ({} assignments)",
                plan.plan_id,
                plan.assignments.len()
            );

            let execution = tokio::time::timeout(self.deadline, async {
                tokio::select! {
                    _ = shutdown.cancelled() => Err(TritonError::Cancelled(
                        "rebalancer shut down".to_string(),
                    )),
                    result = self.executor.execute_plan(&plan) => result,
                }
            })
            .await;

            match execution {
                Ok(Ok(())) => {}
                Ok(Err(TritonError::Cancelled(_))) => return Ok(()),
                Ok(Err(error)) => return Err(error),
                Err(_elapsed) => {
                    return Err(TritonError::Cancelled(format!(
                        "migration plan {} exceeded deadline",
                        plan.plan_id
                    )))
                }
            }
        }
    }
}
