//! Admission control against the process-wide resource budget.
//!
//! The budget counts declared memory estimates, never live OS readings. Only
//! the scheduler loop mutates it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::job_queue::{DatasetRef, JobId, PendingJob};
use crate::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Budget limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total memory the engine may reserve for jobs.
    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling_bytes: u64,
    /// Safety margin kept free below the ceiling.
    #[serde(default = "default_system_reserve")]
    pub system_reserve_bytes: u64,
    /// Maximum number of simultaneously active jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

fn default_memory_ceiling() -> u64 {
    14 * GIB
}

fn default_system_reserve() -> u64 {
    2 * GIB
}

fn default_max_concurrent_jobs() -> usize {
    4
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: default_memory_ceiling(),
            system_reserve_bytes: default_system_reserve(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("max_concurrent_jobs must be at least 1"));
        }
        if self.system_reserve_bytes >= self.memory_ceiling_bytes {
            return Err(Error::config(
                "system_reserve_bytes must be smaller than memory_ceiling_bytes",
            ));
        }
        Ok(())
    }

    /// Memory available to jobs once the reserve is set aside.
    pub fn usable_memory(&self) -> u64 {
        self.memory_ceiling_bytes
            .saturating_sub(self.system_reserve_bytes)
    }
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub memory_ceiling: u64,
    pub reserved_memory: u64,
    pub concurrency_ceiling: usize,
    pub active_count: usize,
}

/// Process-wide reserved memory and active job count.
#[derive(Debug)]
pub struct ResourceBudget {
    config: BudgetConfig,
    reserved_memory: u64,
    active_count: usize,
}

impl ResourceBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            reserved_memory: 0,
            active_count: 0,
        }
    }

    pub fn reserved_memory(&self) -> u64 {
        self.reserved_memory
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn reserve(&mut self, memory: u64) {
        self.reserved_memory = self.reserved_memory.saturating_add(memory);
        self.active_count += 1;
    }

    /// Return a job's reservation on its terminal or requeue transition.
    pub fn release(&mut self, memory: u64) {
        self.reserved_memory = self.reserved_memory.saturating_sub(memory);
        self.active_count = self.active_count.saturating_sub(1);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            memory_ceiling: self.config.memory_ceiling_bytes,
            reserved_memory: self.reserved_memory,
            concurrency_ceiling: self.config.max_concurrent_jobs,
            active_count: self.active_count,
        }
    }
}

/// Outcome of checking the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Budget reserved; the job may be dispatched.
    Admit(JobId),
    /// Not enough memory. The job keeps its place and the tick ends.
    InsufficientMemory { required: u64, available: u64 },
    /// Every worker slot is taken.
    NoWorkerSlot,
}

/// Decides whether the head of the queue fits inside the budget.
#[derive(Debug, Default)]
pub struct AdmissionController;

impl AdmissionController {
    pub fn new() -> Self {
        Self
    }

    /// Check `candidate` and reserve its budget if it fits.
    pub fn try_admit(
        &self,
        budget: &mut ResourceBudget,
        candidate: &PendingJob,
    ) -> AdmissionDecision {
        if budget.active_count >= budget.config.max_concurrent_jobs {
            return AdmissionDecision::NoWorkerSlot;
        }

        let usable = budget.config.usable_memory();
        let available = usable.saturating_sub(budget.reserved_memory);
        // A single job larger than the whole usable budget can never fit next
        // to others; let it run alone instead of blocking the queue forever.
        let oversized_alone =
            candidate.memory_estimate > usable && budget.active_count == 0;
        if candidate.memory_estimate > available && !oversized_alone {
            debug!(
                job_id = candidate.job_id,
                required = candidate.memory_estimate,
                available,
                "Admission deferred: memory budget exhausted"
            );
            return AdmissionDecision::InsufficientMemory {
                required: candidate.memory_estimate,
                available,
            };
        }

        budget.reserve(candidate.memory_estimate);
        AdmissionDecision::Admit(candidate.job_id)
    }
}

/// Estimates a job's peak memory at submission time.
pub trait MemoryEstimator: Send + Sync {
    fn estimate(&self, input: &DatasetRef) -> u64;
}

/// Linear estimate from the instance count with a fixed fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCountEstimator {
    #[serde(default = "default_base_bytes")]
    pub base_bytes: u64,
    #[serde(default = "default_per_instance_bytes")]
    pub per_instance_bytes: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_fallback_bytes")]
    pub fallback_bytes: u64,
}

fn default_base_bytes() -> u64 {
    64 * MIB
}

fn default_per_instance_bytes() -> u64 {
    MIB
}

fn default_max_bytes() -> u64 {
    2 * GIB
}

fn default_fallback_bytes() -> u64 {
    512 * MIB
}

impl Default for InstanceCountEstimator {
    fn default() -> Self {
        Self {
            base_bytes: default_base_bytes(),
            per_instance_bytes: default_per_instance_bytes(),
            max_bytes: default_max_bytes(),
            fallback_bytes: default_fallback_bytes(),
        }
    }
}

impl MemoryEstimator for InstanceCountEstimator {
    fn estimate(&self, input: &DatasetRef) -> u64 {
        match input.instance_count {
            Some(count) if count > 0 => self
                .base_bytes
                .saturating_add(count.saturating_mul(self.per_instance_bytes))
                .min(self.max_bytes),
            _ => self.fallback_bytes,
        }
    }
}

/// Same estimate for every job.
#[derive(Debug, Clone, Copy)]
pub struct FixedEstimator(pub u64);

impl MemoryEstimator for FixedEstimator {
    fn estimate(&self, _input: &DatasetRef) -> u64 {
        self.0
    }
}
