//! 进程关闭
//!
//! 一个关闭广播同时通知三个长期运行的组件：消息处理器（处理完手头的消息后停止消费命令队列）、
//! 调度器事件循环（连同对账与数据库同步定时任务）和模拟集群（停止发送资源供给）。

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

/// 关闭广播的持有者；克隆后共享同一个广播
#[derive(Clone)]
pub struct ShutdownManager {
    /// 已关闭时为 None，之后订阅的组件立即收到信号
    sender: Arc<RwLock<Option<broadcast::Sender<()>>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// 组件启动前取得的关闭接收端
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        if let Some(sender) = self.sender.read().await.as_ref() {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(1);
        let _ = sender.send(());
        receiver
    }

    /// 通知处理器、调度器和模拟集群停止；只有第一次调用生效
    pub async fn shutdown(&self) {
        let Some(sender) = self.sender.write().await.take() else {
            debug!("关闭广播已发送过");
            return;
        };
        let components = sender.receiver_count();
        // 组件都已退出时没有接收端
        let _ = sender.send(());
        info!(components, "已通知各组件停止");
    }

    pub async fn is_shutdown(&self) -> bool {
        self.sender.read().await.is_none()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM，返回收到的信号名
pub async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
