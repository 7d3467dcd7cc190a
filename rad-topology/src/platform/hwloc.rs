use std::sync::{Mutex, MutexGuard};

use hwloc::{CpuSet, ObjectType, Topology, TopologyObject};
use log::{debug, trace};

use super::{
    CpuId, CpuMask, CpuRadPair, Platform, PlatformError, PlatformResult, RadMemorySegment,
};

/// Answers topology queries from an hwloc topology. NUMA node objects play the role of RADs.
///
/// CPUs are identified by their OS index. The active CPU mask reloads the topology on every
/// query; the wiring and memory queries use the topology loaded last.
pub struct HwlocPlatform {
    topology: Mutex<Topology>,
    page_size: u64,
}

impl Default for HwlocPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HwlocPlatform {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            topology: Mutex::new(Topology::new()),
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().expect("poisoned lock")
    }

    fn numa_nodes(topo: &Topology) -> PlatformResult<Vec<&TopologyObject>> {
        match topo.objects_with_type(&ObjectType::NUMANode) {
            Ok(nodes) if !nodes.is_empty() => Ok(nodes),
            Ok(_) => Err(PlatformError::Unsupported),
            Err(err) => {
                debug!("no NUMA nodes in hwloc topology: {:?}", err);
                Err(PlatformError::Unsupported)
            }
        }
    }

    /// OS indices of every CPU slot below `object`, online or not.
    fn complete_cpus(object: &TopologyObject) -> PlatformResult<CpuSet> {
        object
            .complete_cpuset()
            .ok_or_else(|| PlatformError::Malformed(format!("{} has no cpuset", object)))
    }
}

impl Platform for HwlocPlatform {
    fn query_rad_count(&self) -> PlatformResult<usize> {
        let topo = self.lock();
        let nodes = Self::numa_nodes(&topo)?;
        Ok(nodes
            .iter()
            .map(|node| node.os_index() as usize + 1)
            .max()
            .unwrap_or(1))
    }

    fn query_cpu_count(&self) -> PlatformResult<usize> {
        let topo = self.lock();
        Self::complete_cpus(topo.object_at_root())?
            .into_iter()
            .max()
            .map(|max| max as usize + 1)
            .ok_or_else(|| PlatformError::Malformed("no CPUs in hwloc topology".to_string()))
    }

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask> {
        let mut topo = self.lock();
        *topo = Topology::new();

        // Only online processing units are part of a freshly loaded topology.
        let pus = topo
            .objects_with_type(&ObjectType::PU)
            .map_err(|err| PlatformError::Malformed(format!("failed to list PUs: {:?}", err)))?;
        let active: CpuMask = pus.iter().map(|pu| pu.os_index() as usize).collect();
        trace!("hwloc active PUs: {}", pus.len());
        Ok(active)
    }

    fn query_cpu_rad_assignment(
        &self,
        _capacity: usize,
        table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()> {
        let topo = self.lock();
        for node in Self::numa_nodes(&topo)? {
            for cpu in Self::complete_cpus(node)? {
                table.push(CpuRadPair::new(node.os_index(), cpu));
            }
        }
        Ok(())
    }

    fn query_rad_memory_table(
        &self,
        _capacity: usize,
        table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()> {
        let topo = self.lock();
        for node in Self::numa_nodes(&topo)? {
            table.push(RadMemorySegment::new(
                node.os_index(),
                node.total_memory() / self.page_size,
            ));
        }
        Ok(())
    }

    fn query_system_memory_size(&self) -> PlatformResult<u64> {
        let topo = self.lock();
        Ok(topo.object_at_root().total_memory() / self.page_size)
    }

    #[cfg(target_os = "linux")]
    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        super::sysfs::current_cpu()
    }

    #[cfg(not(target_os = "linux"))]
    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        Err(PlatformError::Unsupported)
    }
}
