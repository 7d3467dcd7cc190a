//! A scripted [`Platform`] that records how often each query is issued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::platform::{
    CpuId, CpuMask, CpuRadAssignment, CpuRadPair, Platform, PlatformError, PlatformResult,
    RadMemorySegment,
};

#[derive(Debug, Default)]
pub struct QueryCounts {
    pub rad_count: AtomicUsize,
    pub cpu_count: AtomicUsize,
    pub active_cpu_mask: AtomicUsize,
    pub cpu_rad_assignment: AtomicUsize,
    pub rad_memory_table: AtomicUsize,
    pub system_memory_size: AtomicUsize,
    pub current_cpu: AtomicUsize,
}

impl QueryCounts {
    /// Every query except the RAD and CPU counts.
    pub fn table_queries(&self) -> usize {
        [
            &self.active_cpu_mask,
            &self.cpu_rad_assignment,
            &self.rad_memory_table,
            &self.system_memory_size,
            &self.current_cpu,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Which query [`FakePlatform`] should fail with an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailingQuery {
    CpuCount,
    RadCount,
    ActiveCpuMask,
    CpuRadAssignment,
    RadMemoryTable,
    SystemMemorySize,
}

#[derive(Debug)]
pub struct FakePlatform {
    pub counts: QueryCounts,
    rad_count: Option<usize>,
    cpu_count: usize,
    active: CpuMask,
    assignment: CpuRadAssignment,
    memory: Vec<RadMemorySegment>,
    system_pages: u64,
    current_cpu: CpuId,
    failing: Mutex<Option<FailingQuery>>,
}

impl FakePlatform {
    /// A single-RAD host: the RAD count query reports `Unsupported`.
    pub fn uniform(cpu_count: usize, active: CpuMask, system_pages: u64) -> Self {
        Self {
            counts: QueryCounts::default(),
            rad_count: None,
            cpu_count,
            active,
            assignment: CpuRadAssignment::default(),
            memory: Vec::new(),
            system_pages,
            current_cpu: CpuId::new(0),
            failing: Mutex::new(None),
        }
    }

    /// A multi-RAD host with every CPU below `cpu_count` active.
    pub fn numa(rad_count: usize, cpu_count: usize, raw_assignment: &[(i32, i32)]) -> Self {
        Self::numa_with_active(rad_count, cpu_count, (0..cpu_count).collect(), raw_assignment)
    }

    pub fn numa_with_active(
        rad_count: usize,
        cpu_count: usize,
        active: CpuMask,
        raw_assignment: &[(i32, i32)],
    ) -> Self {
        Self {
            counts: QueryCounts::default(),
            rad_count: Some(rad_count),
            cpu_count,
            active,
            assignment: CpuRadAssignment::from_sentinel_terminated(raw_assignment)
                .expect("invalid raw assignment"),
            memory: Vec::new(),
            system_pages: 0,
            current_cpu: CpuId::new(0),
            failing: Mutex::new(None),
        }
    }

    pub fn with_active(mut self, active: CpuMask) -> Self {
        self.active = active;
        self
    }

    pub fn with_memory(mut self, segments: &[(u32, u64)]) -> Self {
        self.memory = segments
            .iter()
            .map(|&(rad, pages)| RadMemorySegment::new(rad, pages))
            .collect();
        self
    }

    pub fn with_current_cpu(mut self, cpu: u32) -> Self {
        self.current_cpu = CpuId::new(cpu);
        self
    }

    pub fn fail(&self, query: Option<FailingQuery>) {
        *self.failing.lock().expect("poisoned lock") = query;
    }

    fn check(&self, query: FailingQuery) -> PlatformResult<()> {
        if *self.failing.lock().expect("poisoned lock") == Some(query) {
            return Err(PlatformError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{:?} failed", query),
            )));
        }
        Ok(())
    }
}

impl Platform for FakePlatform {
    fn query_rad_count(&self) -> PlatformResult<usize> {
        self.counts.rad_count.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::RadCount)?;
        self.rad_count.ok_or(PlatformError::Unsupported)
    }

    fn query_cpu_count(&self) -> PlatformResult<usize> {
        self.counts.cpu_count.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::CpuCount)?;
        Ok(self.cpu_count)
    }

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask> {
        self.counts.active_cpu_mask.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::ActiveCpuMask)?;
        Ok(self.active.clone())
    }

    fn query_cpu_rad_assignment(
        &self,
        _capacity: usize,
        table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()> {
        self.counts.cpu_rad_assignment.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::CpuRadAssignment)?;
        table.extend(self.assignment.iter().copied());
        Ok(())
    }

    fn query_rad_memory_table(
        &self,
        _capacity: usize,
        table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()> {
        self.counts.rad_memory_table.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::RadMemoryTable)?;
        table.extend_from_slice(&self.memory);
        Ok(())
    }

    fn query_system_memory_size(&self) -> PlatformResult<u64> {
        self.counts.system_memory_size.fetch_add(1, Ordering::SeqCst);
        self.check(FailingQuery::SystemMemorySize)?;
        Ok(self.system_pages)
    }

    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        self.counts.current_cpu.fetch_add(1, Ordering::SeqCst);
        Ok(self.current_cpu)
    }
}
