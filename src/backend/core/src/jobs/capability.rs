//! Capability table: which worker sizes may run each job type, the current
//! runner version per type, and the processing graph (`triggered_by`).
//!
//! The table is validated once at startup. After that every lookup is total.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::job::{JobType, WorkerSizeClass};
use crate::error::{DsqError, Result};

/// Static description of one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Allowed worker sizes, the first one is the default.
    pub sizes: Vec<WorkerSizeClass>,
    /// Current runner version. Cache entries computed by an older runner are stale.
    pub runner_version: u32,
    /// Job types whose success enqueues this one.
    #[serde(default)]
    pub triggered_by: Vec<JobType>,
}

impl JobSpec {
    pub fn new(sizes: &[WorkerSizeClass], runner_version: u32, triggered_by: &[JobType]) -> Self {
        Self {
            sizes: sizes.to_vec(),
            runner_version,
            triggered_by: triggered_by.to_vec(),
        }
    }
}

/// Validated `JobType -> JobSpec` table.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    // Indexed by `JobType as usize`, one slot per variant.
    specs: Vec<JobSpec>,
}

impl CapabilityTable {
    /// Build and validate a table. Every job type must be present.
    pub fn new(mut specs: HashMap<JobType, JobSpec>) -> Result<Self> {
        let mut ordered = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            let spec = specs.remove(&job_type).ok_or_else(|| {
                DsqError::configuration(format!("Capability table is missing job type {}", job_type))
            })?;
            ordered.push(spec);
        }

        let table = Self { specs: ordered };
        table.validate()?;
        Ok(table)
    }

    /// The pipeline's processing graph.
    pub fn builtin() -> Self {
        use JobType::*;
        use WorkerSizeClass::*;

        // Same order as JobType::ALL.
        let specs = vec![
            JobSpec::new(&[Light], 1, &[]),                       // /config-names
            JobSpec::new(&[Light], 1, &[ConfigNames]),            // /split-names
            JobSpec::new(&[Light], 2, &[SplitNames, Info]),       // /splits
            JobSpec::new(&[Medium, Heavy], 3, &[Splits]),         // /first-rows
            JobSpec::new(&[Heavy, Medium], 4, &[ConfigNames]),    // /parquet
            JobSpec::new(&[Light], 1, &[Parquet]),                // /info
            JobSpec::new(&[Light], 1, &[Parquet]),                // /size
            JobSpec::new(&[Heavy], 2, &[Parquet]),                // /statistics
            JobSpec::new(&[Heavy], 1, &[Parquet]),                // /duckdb-index
            JobSpec::new(&[Light], 1, &[FirstRows, DuckdbIndex]), // /is-valid
        ];
        Self { specs }
    }

    /// Replace the allowed sizes of some job types, then re-validate.
    pub fn with_size_overrides(
        mut self,
        overrides: &HashMap<JobType, Vec<WorkerSizeClass>>,
    ) -> Result<Self> {
        for (job_type, sizes) in overrides {
            self.specs[*job_type as usize].sizes = sizes.clone();
        }
        self.validate()?;
        Ok(self)
    }

    /// Check sizes, versions and that `triggered_by` is acyclic.
    pub fn validate(&self) -> Result<()> {
        for job_type in JobType::ALL {
            let spec = self.spec(job_type);
            if spec.sizes.is_empty() {
                return Err(DsqError::configuration(format!(
                    "Job type {} has no allowed worker size",
                    job_type
                )));
            }
            let mut seen = spec.sizes.clone();
            seen.sort();
            seen.dedup();
            if seen.len() != spec.sizes.len() {
                return Err(DsqError::configuration(format!(
                    "Job type {} lists a worker size twice",
                    job_type
                )));
            }
            if spec.runner_version == 0 {
                return Err(DsqError::configuration(format!(
                    "Job type {} must have a runner version of at least 1",
                    job_type
                )));
            }
        }

        let mut graph: DiGraph<JobType, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = JobType::ALL.iter().map(|t| graph.add_node(*t)).collect();
        for job_type in JobType::ALL {
            for parent in &self.spec(job_type).triggered_by {
                graph.add_edge(nodes[*parent as usize], nodes[job_type as usize], ());
            }
        }
        toposort(&graph, None).map_err(|cycle| {
            DsqError::configuration(format!(
                "Processing graph has a cycle through {}",
                graph[cycle.node_id()]
            ))
        })?;

        Ok(())
    }

    pub fn spec(&self, job_type: JobType) -> &JobSpec {
        &self.specs[job_type as usize]
    }

    /// The first allowed size.
    pub fn default_size(&self, job_type: JobType) -> WorkerSizeClass {
        self.spec(job_type).sizes[0]
    }

    pub fn allows(&self, job_type: JobType, size: WorkerSizeClass) -> bool {
        self.spec(job_type).sizes.contains(&size)
    }

    pub fn ensure_allowed(&self, job_type: JobType, size: WorkerSizeClass) -> Result<()> {
        if self.allows(job_type, size) {
            Ok(())
        } else {
            Err(DsqError::worker_size_not_allowed(job_type, size))
        }
    }

    pub fn runner_version(&self, job_type: JobType) -> u32 {
        self.spec(job_type).runner_version
    }

    /// Job types triggered by a success of `job_type`.
    pub fn children(&self, job_type: JobType) -> Vec<JobType> {
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| self.spec(*t).triggered_by.contains(&job_type))
            .collect()
    }

    /// Every allowed `(job type, size)` pair, in a stable order.
    pub fn pairs(&self) -> Vec<(JobType, WorkerSizeClass)> {
        let mut pairs = Vec::new();
        for job_type in JobType::ALL {
            for size in WorkerSizeClass::ALL {
                if self.allows(job_type, size) {
                    pairs.push((job_type, size));
                }
            }
        }
        pairs
    }

    /// Job types a worker of `size` may run.
    pub fn job_types_for(&self, size: WorkerSizeClass) -> Vec<JobType> {
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| self.allows(*t, size))
            .collect()
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::builtin()
    }
}
