use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use super::{
    CpuId, CpuMask, CpuRadPair, Platform, PlatformError, PlatformResult, RadMemorySegment,
};

/// Answers topology queries from the Linux device tree.
///
/// NUMA nodes play the role of RADs. Every CPU in `<root>/cpu/possible` is wired to the node its
/// `<root>/cpu/cpu<N>/node<M>` link names; the link outlives CPU hot-unplug, unlike
/// `<root>/node/node<M>/cpulist`, which is only consulted for CPUs without a link.
/// `<root>/node/node<M>/meminfo` sizes the memory of a node. A kernel built without NUMA support
/// has no `node` directory, which is reported as [`PlatformError::Unsupported`].
#[derive(Debug, Clone)]
pub struct SysfsPlatform {
    root: PathBuf,
    meminfo: PathBuf,
    page_size: u64,
}

impl SysfsPlatform {
    pub fn new(root: impl AsRef<Path>, meminfo: impl AsRef<Path>) -> Self {
        Self::with_page_size(root, meminfo, host_page_size())
    }

    pub fn with_page_size(
        root: impl AsRef<Path>,
        meminfo: impl AsRef<Path>,
        page_size: u64,
    ) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        Self {
            root: root.as_ref().to_path_buf(),
            meminfo: meminfo.as_ref().to_path_buf(),
            page_size,
        }
    }

    fn node_dir(&self) -> PathBuf {
        self.root.join("node")
    }

    /// Ids of every `node<N>` directory, ascending.
    fn node_ids(&self) -> PlatformResult<Vec<u32>> {
        let node_dir = self.node_dir();
        if !node_dir.is_dir() {
            return Err(PlatformError::Unsupported);
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&node_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node") {
                if let Ok(id) = id.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        trace!("sysfs nodes: {:?}", ids);
        Ok(ids)
    }

    fn read_cpulist(&self, path: &Path) -> PlatformResult<Vec<usize>> {
        let content = fs::read_to_string(path)?;
        parse_cpulist(&content)
    }

    /// The node named by the `node<M>` entry of `<root>/cpu/cpu<N>`, if the kernel created one.
    fn node_of_cpu(&self, cpu: usize) -> PlatformResult<Option<u32>> {
        let cpu_dir = self.root.join("cpu").join(format!("cpu{}", cpu));
        if !cpu_dir.is_dir() {
            return Ok(None);
        }
        for entry in fs::read_dir(&cpu_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node") {
                if let Ok(id) = id.parse::<u32>() {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    fn bytes_to_pages(&self, bytes: u64) -> u64 {
        bytes / self.page_size
    }
}

impl Platform for SysfsPlatform {
    fn query_rad_count(&self) -> PlatformResult<usize> {
        let ids = self.node_ids()?;
        match ids.last() {
            Some(max) => Ok(*max as usize + 1),
            None => Err(PlatformError::Malformed(format!(
                "no nodes under {}",
                self.node_dir().display()
            ))),
        }
    }

    fn query_cpu_count(&self) -> PlatformResult<usize> {
        let path = self.root.join("cpu").join("possible");
        let cpus = self.read_cpulist(&path)?;
        cpus.iter()
            .max()
            .map(|max| max + 1)
            .ok_or_else(|| PlatformError::Malformed(format!("{} is empty", path.display())))
    }

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask> {
        let cpus = self.read_cpulist(&self.root.join("cpu").join("online"))?;
        Ok(cpus.into_iter().collect())
    }

    fn query_cpu_rad_assignment(
        &self,
        capacity: usize,
        table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()> {
        // Node cpulists drop offline CPUs on some architectures, so they only fill the gaps.
        let mut listed = HashMap::new();
        for id in self.node_ids()? {
            let cpulist = self.node_dir().join(format!("node{}", id)).join("cpulist");
            if !cpulist.exists() {
                continue;
            }
            for cpu in self.read_cpulist(&cpulist)? {
                listed.entry(cpu).or_insert(id);
            }
        }

        for cpu in self.read_cpulist(&self.root.join("cpu").join("possible"))? {
            match self.node_of_cpu(cpu)?.or_else(|| listed.get(&cpu).copied()) {
                Some(rad) => table.push(CpuRadPair::new(rad, cpu as u32)),
                None => trace!("CPU {} belongs to no node", cpu),
            }
        }
        if table.len() > capacity {
            debug!(
                "CPU/RAD table holds {} pairs, more than the {} expected",
                table.len(),
                capacity
            );
        }
        Ok(())
    }

    fn query_rad_memory_table(
        &self,
        _capacity: usize,
        table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()> {
        for id in self.node_ids()? {
            let meminfo = self.node_dir().join(format!("node{}", id)).join("meminfo");
            if !meminfo.exists() {
                continue;
            }
            let content = fs::read_to_string(&meminfo)?;
            let kib = parse_mem_total_kib(&content).ok_or_else(|| {
                PlatformError::Malformed(format!("MemTotal not found in {}", meminfo.display()))
            })?;
            table.push(RadMemorySegment::new(id, self.bytes_to_pages(kib * 1024)));
        }
        Ok(())
    }

    fn query_system_memory_size(&self) -> PlatformResult<u64> {
        let content = fs::read_to_string(&self.meminfo)?;
        let kib = parse_mem_total_kib(&content).ok_or_else(|| {
            PlatformError::Malformed(format!("MemTotal not found in {}", self.meminfo.display()))
        })?;
        Ok(self.bytes_to_pages(kib * 1024))
    }

    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        current_cpu()
    }
}

pub(crate) fn current_cpu() -> PlatformResult<CpuId> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(CpuId::new(cpu as u32))
}

fn host_page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Parses the kernel's list format, e.g. `0-3,7,10-11`. An empty list is valid.
pub fn parse_cpulist(cpulist: &str) -> PlatformResult<Vec<usize>> {
    let malformed = || PlatformError::Malformed(format!("bad cpulist {:?}", cpulist.trim()));

    let mut cpus = Vec::new();
    for part in cpulist.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().map_err(|_| malformed())?;
                let end: usize = end.trim().parse().map_err(|_| malformed())?;
                if end < start {
                    return Err(malformed());
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse().map_err(|_| malformed())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Finds the `MemTotal` line of either `/proc/meminfo` (`MemTotal: 123 kB`) or a per-node
/// meminfo (`Node 0 MemTotal: 123 kB`).
fn parse_mem_total_kib(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let key = if line.starts_with("Node") {
            parts.nth(2)?
        } else {
            parts.next()?
        };
        if key != "MemTotal:" {
            return None;
        }
        parts.next()?.parse().ok()
    })
}
