//! Resource records shared by node capacity, allocations, and requests.
//!
//! A single [`ResourceSpec`] shape serves as capacity, current allocation, and
//! requirement. Cpu is fractional cores; memory/disk are MB; gpu, disk, and
//! network dimensions are optional, and `custom` is an open-ended numeric map
//! for site-specific dimensions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tolerance for fractional-cpu comparisons.
const CPU_EPSILON: f64 = 1e-9;

/// A record of numeric resources in every dimension the scheduler knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Cpu cores, fractional.
    pub cpu: f64,
    /// Memory in MB.
    pub memory_mb: u64,
    /// Gpu memory in MB, when the dimension applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<u64>,
    /// Number of gpus, when the dimension applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// Disk in MB, when the dimension applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<u64>,
    /// Network bandwidth in Mbps, when the dimension applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mbps: Option<u64>,
    /// Open-ended custom dimensions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, f64>,
}

impl ResourceSpec {
    /// A requirement of `cpu` cores and `memory_mb` MB with no other dimensions.
    pub fn cpu_memory(cpu: f64, memory_mb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            ..Self::default()
        }
    }

    /// Reject negative or non-finite dimensions.
    pub fn validate(&self) -> Result<(), String> {
        if !self.cpu.is_finite() || self.cpu < 0.0 {
            return Err(format!("cpu must be a non-negative finite number, got {}", self.cpu));
        }
        for (key, value) in &self.custom {
            if !value.is_finite() || *value < 0.0 {
                return Err(format!(
                    "custom resource '{key}' must be non-negative and finite, got {value}"
                ));
            }
        }
        Ok(())
    }

    /// True iff adding `request` on top of `self` (the current allocation)
    /// stays within `capacity` in every dimension the request names.
    ///
    /// A dimension the request leaves unset places no constraint. A requested
    /// dimension the capacity lacks is treated as zero capacity and rejected.
    pub fn fits(&self, request: &Self, capacity: &Self) -> bool {
        if self.cpu + request.cpu > capacity.cpu + CPU_EPSILON {
            return false;
        }
        if self.memory_mb + request.memory_mb > capacity.memory_mb {
            return false;
        }
        if let Some(req) = request.gpu_memory_mb {
            let used = self.gpu_memory_mb.unwrap_or(0);
            if used + req > capacity.gpu_memory_mb.unwrap_or(0) {
                return false;
            }
        }
        if let Some(req) = request.gpu_count {
            let used = self.gpu_count.unwrap_or(0);
            if used + req > capacity.gpu_count.unwrap_or(0) {
                return false;
            }
        }
        if let Some(req) = request.disk_mb {
            let used = self.disk_mb.unwrap_or(0);
            if used + req > capacity.disk_mb.unwrap_or(0) {
                return false;
            }
        }
        if let Some(req) = request.network_mbps {
            let used = self.network_mbps.unwrap_or(0);
            if used + req > capacity.network_mbps.unwrap_or(0) {
                return false;
            }
        }
        for (key, req) in &request.custom {
            let used = self.custom.get(key).copied().unwrap_or(0.0);
            let cap = capacity.custom.get(key).copied().unwrap_or(0.0);
            if used + req > cap + CPU_EPSILON {
                return false;
            }
        }
        true
    }

    /// Add `other` into this allocation record.
    pub fn accumulate(&mut self, other: &Self) {
        self.cpu += other.cpu;
        self.memory_mb += other.memory_mb;
        if let Some(v) = other.gpu_memory_mb {
            *self.gpu_memory_mb.get_or_insert(0) += v;
        }
        if let Some(v) = other.gpu_count {
            *self.gpu_count.get_or_insert(0) += v;
        }
        if let Some(v) = other.disk_mb {
            *self.disk_mb.get_or_insert(0) += v;
        }
        if let Some(v) = other.network_mbps {
            *self.network_mbps.get_or_insert(0) += v;
        }
        for (key, v) in &other.custom {
            *self.custom.entry(key.clone()).or_insert(0.0) += v;
        }
    }

    /// Subtract `other` from this allocation record, saturating at zero.
    pub fn subtract(&mut self, other: &Self) {
        self.cpu = (self.cpu - other.cpu).max(0.0);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        if let Some(v) = other.gpu_memory_mb {
            if let Some(cur) = self.gpu_memory_mb.as_mut() {
                *cur = cur.saturating_sub(v);
            }
        }
        if let Some(v) = other.gpu_count {
            if let Some(cur) = self.gpu_count.as_mut() {
                *cur = cur.saturating_sub(v);
            }
        }
        if let Some(v) = other.disk_mb {
            if let Some(cur) = self.disk_mb.as_mut() {
                *cur = cur.saturating_sub(v);
            }
        }
        if let Some(v) = other.network_mbps {
            if let Some(cur) = self.network_mbps.as_mut() {
                *cur = cur.saturating_sub(v);
            }
        }
        for (key, v) in &other.custom {
            if let Some(cur) = self.custom.get_mut(key) {
                *cur = (*cur - v).max(0.0);
            }
        }
    }

    /// True iff `self` plus `extra` covers `needed` in cpu, memory, and the
    /// gpu dimensions `needed` names. Used by the preemption planner to test
    /// whether freed resources meet a request.
    pub fn covers_with(&self, extra: &Self, needed: &Self) -> bool {
        if self.cpu + extra.cpu + CPU_EPSILON < needed.cpu {
            return false;
        }
        if self.memory_mb + extra.memory_mb < needed.memory_mb {
            return false;
        }
        if let Some(req) = needed.gpu_memory_mb {
            if self.gpu_memory_mb.unwrap_or(0) + extra.gpu_memory_mb.unwrap_or(0) < req {
                return false;
            }
        }
        if let Some(req) = needed.gpu_count {
            if self.gpu_count.unwrap_or(0) + extra.gpu_count.unwrap_or(0) < req {
                return false;
            }
        }
        true
    }

    /// A coarse magnitude used to rank victims by eviction payoff
    /// (memory-normalized so one core weighs like one GB).
    pub fn magnitude(&self) -> f64 {
        self.cpu * 1024.0 + self.memory_mb as f64
    }
}
