use std::fmt;

use anyhow::Result;
use rad_topology::{CpuId, Platform, RadAggregator, RadId, TopologyCache};
use serde::Serialize;

/// Snapshot of the RAD layout of the current host.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyReport {
    max_rads: usize,
    max_cpus: usize,
    home_rad: RadId,
    rads: Vec<RadReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RadReport {
    rad: RadId,
    active_cpus: u64,
    memory_pages: u64,
    cpus: Vec<CpuId>,
}

impl TopologyReport {
    pub fn collect<P: Platform>(topology: &TopologyCache<P>) -> Result<Self> {
        let aggregator = RadAggregator::new(topology);
        let active = aggregator.active_cpus_per_rad()?;
        let memory = aggregator.memory_per_rad()?;

        let rads = active
            .iter()
            .map(|(rad, active_cpus)| {
                Ok(RadReport {
                    rad,
                    active_cpus,
                    memory_pages: memory[rad],
                    cpus: topology.cpus_of_rad(rad)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TopologyReport {
            max_rads: topology.max_rads(),
            max_cpus: topology.max_cpus(),
            home_rad: topology.home_rad()?,
            rads,
        })
    }

    pub fn max_rads(&self) -> usize {
        self.max_rads
    }

    /// RADs with both active CPUs and memory.
    pub fn placeable_rads(&self) -> impl Iterator<Item = RadId> + '_ {
        self.rads
            .iter()
            .filter(|r| r.active_cpus > 0 && r.memory_pages > 0)
            .map(|r| r.rad)
    }
}

impl fmt::Display for TopologyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "max RADs: {}", self.max_rads)?;
        writeln!(f, "max CPUs: {}", self.max_cpus)?;
        writeln!(f, "home RAD: {}", self.home_rad)?;
        writeln!(f, "{:>5} {:>12} {:>14}", "RAD", "active CPUs", "memory pages")?;
        for rad in &self.rads {
            writeln!(
                f,
                "{:>5} {:>12} {:>14}",
                rad.rad, rad.active_cpus, rad.memory_pages
            )?;
        }
        Ok(())
    }
}
