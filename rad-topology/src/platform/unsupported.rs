use super::{
    CpuId, CpuMask, CpuRadPair, Platform, PlatformError, PlatformResult, RadMemorySegment,
};

/// Backend for hosts without any RAD introspection. The RAD count reports
/// [`PlatformError::Unsupported`], so callers see a single RAD holding every CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPlatform;

impl Platform for UnsupportedPlatform {
    fn query_rad_count(&self) -> PlatformResult<usize> {
        Err(PlatformError::Unsupported)
    }

    fn query_cpu_count(&self) -> PlatformResult<usize> {
        Ok(num_cpus::get())
    }

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask> {
        Ok((0..num_cpus::get()).collect())
    }

    fn query_cpu_rad_assignment(
        &self,
        _capacity: usize,
        _table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()> {
        Err(PlatformError::Unsupported)
    }

    fn query_rad_memory_table(
        &self,
        _capacity: usize,
        _table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()> {
        Err(PlatformError::Unsupported)
    }

    fn query_system_memory_size(&self) -> PlatformResult<u64> {
        Err(PlatformError::Unsupported)
    }

    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        Err(PlatformError::Unsupported)
    }
}
