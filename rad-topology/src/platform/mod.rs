//! Platform query capabilities.
//!
//! Every fact the topology layer knows about the host comes through the [`Platform`] trait. The
//! trait mirrors the host's native topology introspection calls one to one and performs no
//! interpretation of its own; caching and aggregation live in [`crate::topology`] and
//! [`crate::aggregate`].

#[cfg(feature = "hwloc")]
mod hwloc;
#[cfg(target_os = "linux")]
mod sysfs;
mod unsupported;

#[cfg(feature = "hwloc")]
pub use self::hwloc::HwlocPlatform;
#[cfg(target_os = "linux")]
pub use self::sysfs::{parse_cpulist, SysfsPlatform};
pub use self::unsupported::UnsupportedPlatform;

use std::convert::TryFrom;
use std::fmt;

use serde::Serialize;

use crate::settings::Settings;

/// Index of a Resource Affinity Domain.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct RadId(u32);

impl RadId {
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Index of a logical processor.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct CpuId(u32);

impl CpuId {
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuRadPair {
    pub rad: RadId,
    pub cpu: CpuId,
}

impl CpuRadPair {
    pub fn new(rad: u32, cpu: u32) -> Self {
        Self {
            rad: RadId(rad),
            cpu: CpuId(cpu),
        }
    }
}

/// One RAD memory segment as reported by the platform. Several segments may belong to the same
/// RAD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadMemorySegment {
    pub rad: RadId,
    pub pages: u64,
}

impl RadMemorySegment {
    pub fn new(rad: u32, pages: u64) -> Self {
        Self {
            rad: RadId(rad),
            pages,
        }
    }
}

/// Static wiring of CPU slots to RADs. A CPU listed here need not be active.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuRadAssignment {
    pairs: Vec<CpuRadPair>,
}

/// CPU id marking the end of a raw CPU/RAD table.
pub const CPU_SENTINEL: i32 = -1;

impl CpuRadAssignment {
    pub fn new(pairs: Vec<CpuRadPair>) -> Self {
        Self { pairs }
    }

    /// Builds an assignment from a raw `(rad, cpu)` table terminated by a pair whose cpu is
    /// [`CPU_SENTINEL`]. Entries after the sentinel are ignored; a table without a sentinel is
    /// consumed up to its length.
    pub fn from_sentinel_terminated(raw: &[(i32, i32)]) -> Result<Self, PlatformError> {
        let pairs = raw
            .iter()
            .take_while(|(_, cpu)| *cpu != CPU_SENTINEL)
            .map(|&(rad, cpu)| {
                let rad = u32::try_from(rad)
                    .map_err(|_| PlatformError::Malformed(format!("negative RAD id {}", rad)))?;
                let cpu = u32::try_from(cpu)
                    .map_err(|_| PlatformError::Malformed(format!("negative CPU id {}", cpu)))?;
                Ok(CpuRadPair::new(rad, cpu))
            })
            .collect::<Result<Vec<_>, PlatformError>>()?;

        Ok(Self { pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuRadPair> {
        self.pairs.iter()
    }

    pub fn rad_of(&self, cpu: CpuId) -> Option<RadId> {
        self.pairs.iter().find(|p| p.cpu == cpu).map(|p| p.rad)
    }

    pub fn cpus_of(&self, rad: RadId) -> impl Iterator<Item = CpuId> + '_ {
        self.pairs
            .iter()
            .filter(move |p| p.rad == rad)
            .map(|p| p.cpu)
    }
}

/// Bitmask of currently active CPUs, bit `c` set when CPU `c` is online.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuMask {
    words: Vec<u64>,
}

impl CpuMask {
    const WORD_BITS: usize = 64;

    pub fn empty() -> Self {
        Self::default()
    }

    /// A mask holding the low 64 CPUs given by `bits`.
    pub fn from_bits(bits: u64) -> Self {
        Self { words: vec![bits] }
    }

    pub fn set(&mut self, cpu: usize) {
        let word = cpu / Self::WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (cpu % Self::WORD_BITS);
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / Self::WORD_BITS)
            .is_some_and(|w| (w >> (cpu % Self::WORD_BITS)) & 1 == 1)
    }

    /// Number of set bits in `[0, limit)`.
    pub fn count_below(&self, limit: usize) -> usize {
        let full = limit / Self::WORD_BITS;
        let rest = limit % Self::WORD_BITS;
        let mut count: usize = self
            .words
            .iter()
            .take(full)
            .map(|w| w.count_ones() as usize)
            .sum();
        if rest > 0 {
            if let Some(w) = self.words.get(full) {
                count += (w & ((1u64 << rest) - 1)).count_ones() as usize;
            }
        }
        count
    }

    /// Number of bits the mask can represent.
    pub fn width(&self) -> usize {
        self.words.len() * Self::WORD_BITS
    }
}

impl std::iter::FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = CpuMask::empty();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("RAD awareness is not supported on this platform")]
    Unsupported,
    #[error("platform query failed: {}", _0)]
    Io(#[from] std::io::Error),
    #[error("malformed platform data: {}", _0)]
    Malformed(String),
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Topology introspection services of the host.
///
/// Table queries fill a buffer the caller has already sized to `capacity`. The capacity is a hint:
/// an implementation may push more entries than that, and callers consume all of them.
pub trait Platform: Send + Sync {
    fn query_rad_count(&self) -> PlatformResult<usize>;

    fn query_cpu_count(&self) -> PlatformResult<usize>;

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask>;

    fn query_cpu_rad_assignment(
        &self,
        capacity: usize,
        table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()>;

    fn query_rad_memory_table(
        &self,
        capacity: usize,
        table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()>;

    /// Total system memory, in pages.
    fn query_system_memory_size(&self) -> PlatformResult<u64>;

    /// The CPU the calling thread is running on.
    fn query_current_cpu(&self) -> PlatformResult<CpuId>;
}

impl<P: Platform + ?Sized> Platform for Box<P> {
    fn query_rad_count(&self) -> PlatformResult<usize> {
        (**self).query_rad_count()
    }

    fn query_cpu_count(&self) -> PlatformResult<usize> {
        (**self).query_cpu_count()
    }

    fn query_active_cpu_mask(&self) -> PlatformResult<CpuMask> {
        (**self).query_active_cpu_mask()
    }

    fn query_cpu_rad_assignment(
        &self,
        capacity: usize,
        table: &mut Vec<CpuRadPair>,
    ) -> PlatformResult<()> {
        (**self).query_cpu_rad_assignment(capacity, table)
    }

    fn query_rad_memory_table(
        &self,
        capacity: usize,
        table: &mut Vec<RadMemorySegment>,
    ) -> PlatformResult<()> {
        (**self).query_rad_memory_table(capacity, table)
    }

    fn query_system_memory_size(&self) -> PlatformResult<u64> {
        (**self).query_system_memory_size()
    }

    fn query_current_cpu(&self) -> PlatformResult<CpuId> {
        (**self).query_current_cpu()
    }
}

/// Picks the platform backend described by `settings`.
pub fn default_platform(settings: &Settings) -> Box<dyn Platform> {
    #[cfg(feature = "hwloc")]
    {
        if settings.use_hwloc {
            return Box::new(HwlocPlatform::new());
        }
    }
    #[cfg(not(feature = "hwloc"))]
    {
        if settings.use_hwloc {
            log::warn!("use_hwloc is set but the hwloc feature is not compiled in");
        }
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(SysfsPlatform::new(&settings.sysfs_root, &settings.meminfo_path))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_terminated_table() {
        let raw = [(0, 0), (0, 1), (1, 2), (1, CPU_SENTINEL), (1, 3)];
        let table = CpuRadAssignment::from_sentinel_terminated(&raw).expect("valid table");
        assert_eq!(table.len(), 3);
        assert_eq!(table.rad_of(CpuId::new(2)), Some(RadId::new(1)));
        assert_eq!(table.rad_of(CpuId::new(3)), None);
    }

    #[test]
    fn test_negative_ids_rejected() {
        let err = CpuRadAssignment::from_sentinel_terminated(&[(-2, 0), (0, CPU_SENTINEL)]);
        assert!(matches!(err, Err(PlatformError::Malformed(_))));

        let err = CpuRadAssignment::from_sentinel_terminated(&[(0, -5)]);
        assert!(matches!(err, Err(PlatformError::Malformed(_))));
    }

    #[test]
    fn test_cpus_of_rad() {
        let raw = [(1, 4), (0, 0), (1, 5), (0, CPU_SENTINEL)];
        let table = CpuRadAssignment::from_sentinel_terminated(&raw).expect("valid table");
        let cpus: Vec<_> = table.cpus_of(RadId::new(1)).collect();
        assert_eq!(cpus, vec![CpuId::new(4), CpuId::new(5)]);
        assert!(table.cpus_of(RadId::new(2)).next().is_none());
    }

    #[test]
    fn test_cpu_mask() {
        let mask = CpuMask::from_bits(0b1011);
        assert!(mask.is_set(0));
        assert!(!mask.is_set(2));
        assert!(!mask.is_set(200));
        assert_eq!(mask.count_below(64), 3);
        assert_eq!(mask.count_below(2), 2);
        assert_eq!(mask.count_below(0), 0);

        let wide: CpuMask = vec![1, 63, 64, 130].into_iter().collect();
        assert_eq!(wide.width(), 192);
        assert!(wide.is_set(130));
        assert_eq!(wide.count_below(64), 2);
        assert_eq!(wide.count_below(65), 3);
        assert_eq!(wide.count_below(1000), 4);
    }
}
