use serde::{Deserialize, Serialize};

/// 本地模拟集群中的一个代理节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAgentConfig {
    /// 为空时使用本机主机名
    #[serde(default)]
    pub hostname: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

/// 本地模拟集群配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub agents: Vec<ClusterAgentConfig>,
    pub offer_interval_ms: u64,
    /// 模拟任务从 RUNNING 到 FINISHED 的耗时
    pub task_duration_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            agents: vec![ClusterAgentConfig {
                hostname: "localhost".to_string(),
                cpus: 4.0,
                mem: 8192.0,
                disk: 102400.0,
            }],
            offer_interval_ms: 1000,
            task_duration_ms: 500,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.offer_interval_ms == 0 {
            return Err(anyhow::anyhow!("资源供给间隔必须大于0"));
        }

        for agent in &self.agents {
            if agent.cpus <= 0.0 || agent.mem <= 0.0 || agent.disk < 0.0 {
                return Err(anyhow::anyhow!(
                    "代理节点 {:?} 的资源配置无效",
                    agent.hostname
                ));
            }
        }

        Ok(())
    }
}
