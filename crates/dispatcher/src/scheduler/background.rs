//! 调度器的后台定时任务：任务对账与存储同步

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::ScaleScheduler;

/// 启动对账和存储同步两个定时任务，收到关闭信号时退出
pub fn spawn(
    scheduler: Arc<ScaleScheduler>,
    shutdown: &broadcast::Receiver<()>,
) -> Vec<JoinHandle<()>> {
    let reconciliation_every =
        Duration::from_secs(scheduler.config().reconciliation_interval_seconds.max(1));
    let db_sync_every = Duration::from_secs(scheduler.config().db_sync_interval_seconds.max(1));

    let reconciliation = {
        let scheduler = scheduler.clone();
        let mut shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciliation_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => scheduler.reconcile().await,
                }
            }
            debug!("对账任务退出");
        })
    };

    let db_sync = {
        let mut shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(db_sync_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.sync_with_database().await {
                            error!(error = %e, "与存储同步失败");
                        }
                    }
                }
            }
            debug!("存储同步任务退出");
        })
    };

    vec![reconciliation, db_sync]
}
