use std::sync::{Arc, Mutex, OnceLock};

use lazy_static::lazy_static;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::platform::{
    self, CpuId, CpuRadAssignment, CpuRadPair, Platform, PlatformError, RadId,
};
use crate::settings::SETTINGS;

lazy_static! {
    pub static ref TOPOLOGY: TopologyCache<Box<dyn Platform>> =
        TopologyCache::new(platform::default_platform(&SETTINGS));
}

/// Immutable system facts, each fetched from the platform at most once.
///
/// The RAD and CPU counts are system constants. The CPU/RAD assignment is fixed after boot even
/// though the set of active CPUs is not, so it is cached too. Concurrent first callers block on
/// the pending fetch instead of issuing their own query.
pub struct TopologyCache<P> {
    platform: P,
    max_rads: OnceLock<usize>,
    max_cpus: OnceLock<usize>,
    assignment: Mutex<Option<Arc<CpuRadAssignment>>>,
}

impl<P: Platform> TopologyCache<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            max_rads: OnceLock::new(),
            max_cpus: OnceLock::new(),
            assignment: Mutex::new(None),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Maximum number of RADs on this system.
    ///
    /// A platform without RAD support is treated as a single RAD. Any other failure means the host
    /// is broken and panics.
    pub fn max_rads(&self) -> usize {
        *self
            .max_rads
            .get_or_init(|| match self.platform.query_rad_count() {
                Ok(0) => panic!("platform reported zero RADs"),
                Ok(rads) => {
                    debug!("max RADs: {}", rads);
                    rads
                }
                Err(PlatformError::Unsupported) => {
                    info!("RAD awareness unsupported, assuming a single RAD");
                    1
                }
                Err(err) => panic!("failed to query the RAD count: {}", err),
            })
    }

    /// Maximum number of CPUs on this system. Panics if the platform cannot tell.
    pub fn max_cpus(&self) -> usize {
        *self
            .max_cpus
            .get_or_init(|| match self.platform.query_cpu_count() {
                Ok(0) => panic!("platform reported zero CPUs"),
                Ok(cpus) => {
                    debug!("max CPUs: {}", cpus);
                    cpus
                }
                Err(err) => panic!("failed to query the CPU count: {}", err),
            })
    }

    /// The CPU/RAD wiring, fetched on first use. A failed fetch is not cached.
    pub fn cpu_rad_assignment(&self) -> Result<Arc<CpuRadAssignment>> {
        let mut cached = self.assignment.lock().expect("poisoned lock");
        if let Some(table) = &*cached {
            return Ok(Arc::clone(table));
        }

        // One slot per CPU plus the terminating entry of the native table.
        let capacity = self.max_cpus() + 1;
        let mut pairs: Vec<CpuRadPair> = Vec::new();
        pairs.try_reserve_exact(capacity)?;
        self.platform.query_cpu_rad_assignment(capacity, &mut pairs)?;

        let table = Arc::new(CpuRadAssignment::new(pairs));
        debug!("cached CPU/RAD assignment of {} pairs", table.len());
        *cached = Some(Arc::clone(&table));
        Ok(table)
    }

    pub fn check_rad(&self, rad: RadId) -> Result<()> {
        let max_rads = self.max_rads();
        if rad.index() >= max_rads {
            return Err(Error::InvalidRad { rad, max_rads });
        }
        Ok(())
    }

    /// CPUs wired to `rad`, active or not.
    pub fn cpus_of_rad(&self, rad: RadId) -> Result<Vec<CpuId>> {
        self.check_rad(rad)?;
        if self.max_rads() == 1 {
            return Ok((0..self.max_cpus() as u32).map(CpuId::new).collect());
        }
        Ok(self.cpu_rad_assignment()?.cpus_of(rad).collect())
    }

    /// The RAD of the CPU the calling thread currently runs on.
    ///
    /// Threads migrate; the answer is only stable for a thread bound to the CPUs of one RAD.
    pub fn home_rad(&self) -> Result<RadId> {
        if self.max_rads() == 1 {
            return Ok(RadId::new(0));
        }

        let cpu = self.platform.query_current_cpu()?;
        self.cpu_rad_assignment()?.rad_of(cpu).ok_or_else(|| {
            Error::Platform(PlatformError::Malformed(format!(
                "CPU {} is missing from the CPU/RAD assignment",
                cpu
            )))
        })
    }
}
