use serde::{Deserialize, Serialize};

/// 节点（或一次资源供给）上的可用资源
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpus: f64,
    /// MiB
    pub mem: f64,
    /// MiB
    pub disk: f64,
}

impl NodeResources {
    pub fn new(cpus: f64, mem: f64, disk: f64) -> Self {
        Self { cpus, mem, disk }
    }

    pub fn add(&mut self, other: &NodeResources) {
        self.cpus += other.cpus;
        self.mem += other.mem;
        self.disk += other.disk;
    }

    /// 扣减资源，结果不低于 0
    pub fn subtract(&mut self, other: &NodeResources) {
        self.cpus = (self.cpus - other.cpus).max(0.0);
        self.mem = (self.mem - other.mem).max(0.0);
        self.disk = (self.disk - other.disk).max(0.0);
    }

    pub fn is_sufficient_to_meet(&self, required: &NodeResources) -> bool {
        self.cpus >= required.cpus && self.mem >= required.mem && self.disk >= required.disk
    }

    pub fn is_empty(&self) -> bool {
        self.cpus <= 0.0 && self.mem <= 0.0 && self.disk <= 0.0
    }
}

/// 作业执行所需（或已分配）的资源
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResources {
    pub cpus: f64,
    pub mem: f64,
    pub disk_in: f64,
    pub disk_out: f64,
    pub disk_total: f64,
}

impl JobResources {
    /// disk_total 始终为输入与输出磁盘之和
    pub fn new(cpus: f64, mem: f64, disk_in: f64, disk_out: f64) -> Self {
        Self {
            cpus,
            mem,
            disk_in,
            disk_out,
            disk_total: disk_in + disk_out,
        }
    }

    pub fn as_node_resources(&self) -> NodeResources {
        NodeResources::new(self.cpus, self.mem, self.disk_total)
    }

    /// 返回未满足 `required` 的资源名称，全部满足时为空
    pub fn shortfall(&self, required: &JobResources) -> Vec<&'static str> {
        let mut short = Vec::new();
        if self.cpus < required.cpus {
            short.push("cpus");
        }
        if self.mem < required.mem {
            short.push("mem");
        }
        if self.disk_in < required.disk_in {
            short.push("disk_in");
        }
        if self.disk_out < required.disk_out {
            short.push("disk_out");
        }
        if self.disk_total < required.disk_total {
            short.push("disk_total");
        }
        short
    }
}
