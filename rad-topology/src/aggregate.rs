//! Per-RAD aggregation of flat platform tables.
//!
//! The platform describes CPUs and memory as flat tables: one `(rad, cpu)` pair per CPU slot and
//! one `(rad, pages)` entry per memory segment. [`RadAggregator`] folds those tables into one
//! bucket per RAD, indexed by [`RadId`].

use std::ops::Index;

use log::{trace, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::platform::{Platform, RadId, RadMemorySegment};
use crate::topology::TopologyCache;

/// One count per RAD, index = RAD id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PerRadCounts(Vec<u64>);

impl PerRadCounts {
    pub fn get(&self, rad: RadId) -> Option<u64> {
        self.0.get(rad.index()).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RadId, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(rad, count)| (RadId::new(rad as u32), *count))
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

impl Index<RadId> for PerRadCounts {
    type Output = u64;

    fn index(&self, rad: RadId) -> &u64 {
        &self.0[rad.index()]
    }
}

impl From<PerRadCounts> for Vec<u64> {
    fn from(counts: PerRadCounts) -> Vec<u64> {
        counts.0
    }
}

pub struct RadAggregator<'a, P> {
    topology: &'a TopologyCache<P>,
}

impl<'a, P: Platform> RadAggregator<'a, P> {
    pub fn new(topology: &'a TopologyCache<P>) -> Self {
        Self { topology }
    }

    fn ensure_capacity(&self, buckets: &[u64]) -> Result<usize> {
        let required = self.topology.max_rads();
        if buckets.len() < required {
            return Err(Error::BufferTooSmall {
                required,
                capacity: buckets.len(),
            });
        }
        Ok(required)
    }

    /// Counts the active CPUs of every RAD into `buckets[..max_rads]` and returns `max_rads`.
    ///
    /// The active CPU mask is read fresh on every call; the CPU/RAD wiring comes from the
    /// topology cache. CPUs that are active but absent from the wiring are not counted anywhere.
    /// On error `buckets` is left untouched.
    pub fn count_active_cpus_per_rad(&self, buckets: &mut [u64]) -> Result<usize> {
        let max_rads = self.ensure_capacity(buckets)?;
        let active = self.topology.platform().query_active_cpu_mask()?;

        if max_rads == 1 {
            buckets[0] = active.count_below(self.topology.max_cpus()) as u64;
            return Ok(1);
        }

        let assignment = self.topology.cpu_rad_assignment()?;
        let buckets = &mut buckets[..max_rads];
        buckets.iter_mut().for_each(|b| *b = 0);
        for pair in assignment.iter() {
            match buckets.get_mut(pair.rad.index()) {
                Some(bucket) => {
                    if active.is_set(pair.cpu.index()) {
                        *bucket += 1;
                    }
                }
                None => warn!(
                    "CPU {} wired to RAD {} beyond {} RADs, skipping",
                    pair.cpu, pair.rad, max_rads
                ),
            }
        }
        trace!("active CPUs per RAD: {:?}", buckets);
        Ok(max_rads)
    }

    /// Sums the memory pages of every RAD into `buckets[..max_rads]` and returns `max_rads`.
    ///
    /// A single-RAD system reports the total system memory. Otherwise the RAD memory table is read
    /// fresh and its segments summed per RAD in one pass. On error `buckets` is left untouched.
    pub fn sum_memory_per_rad(&self, buckets: &mut [u64]) -> Result<usize> {
        let max_rads = self.ensure_capacity(buckets)?;
        let platform = self.topology.platform();

        if max_rads == 1 {
            buckets[0] = platform.query_system_memory_size()?;
            return Ok(1);
        }

        let mut segments: Vec<RadMemorySegment> = Vec::new();
        segments.try_reserve_exact(max_rads)?;
        platform.query_rad_memory_table(max_rads, &mut segments)?;

        let mut totals: Vec<u64> = Vec::new();
        totals.try_reserve_exact(max_rads)?;
        totals.resize(max_rads, 0);
        for segment in &segments {
            match totals.get_mut(segment.rad.index()) {
                Some(total) => *total += segment.pages,
                None => warn!(
                    "memory segment of RAD {} beyond {} RADs, skipping",
                    segment.rad, max_rads
                ),
            }
        }

        buckets[..max_rads].copy_from_slice(&totals);
        trace!("memory pages per RAD: {:?}", totals);
        Ok(max_rads)
    }

    pub fn active_cpus_per_rad(&self) -> Result<PerRadCounts> {
        let mut buckets = vec![0; self.topology.max_rads()];
        self.count_active_cpus_per_rad(&mut buckets)?;
        Ok(PerRadCounts(buckets))
    }

    pub fn memory_per_rad(&self) -> Result<PerRadCounts> {
        let mut buckets = vec![0; self.topology.max_rads()];
        self.sum_memory_per_rad(&mut buckets)?;
        Ok(PerRadCounts(buckets))
    }

    /// RADs holding at least one active CPU and some memory, ascending. These are the RADs worth
    /// placing work on.
    pub fn rads_with_cpus_and_memory(&self) -> Result<Vec<RadId>> {
        let memory = self.memory_per_rad()?;
        let cpus = self.active_cpus_per_rad()?;
        Ok(cpus
            .iter()
            .filter(|&(rad, count)| count > 0 && memory[rad] > 0)
            .map(|(rad, _)| rad)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::platform::{CpuMask, PlatformError};
    use crate::test_helper::{FailingQuery, FakePlatform};

    const TWO_RADS: &[(i32, i32)] = &[(0, 0), (0, 1), (1, 2), (1, 3), (0, -1)];

    #[test]
    fn test_active_cpus_two_rads() {
        fil_logger::maybe_init();
        let topo = TopologyCache::new(
            FakePlatform::numa(2, 4, TWO_RADS).with_active(CpuMask::from_bits(0b1011)),
        );
        let aggregator = RadAggregator::new(&topo);

        let counts = aggregator.active_cpus_per_rad().expect("aggregation failed");
        assert_eq!(counts.as_slice(), &[2, 1]);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_active_cpus_single_rad() {
        let topo = TopologyCache::new(FakePlatform::uniform(4, CpuMask::from_bits(0b11_0111), 0));
        let aggregator = RadAggregator::new(&topo);

        let mut buckets = [99; 3];
        assert_eq!(aggregator.count_active_cpus_per_rad(&mut buckets).expect("ok"), 1);
        // Only bits below max CPUs count.
        assert_eq!(buckets, [3, 99, 99]);
        assert_eq!(
            topo.platform()
                .counts
                .cpu_rad_assignment
                .load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn test_sentinel_stops_scan() {
        let raw = [(0, 0), (1, 1), (1, -1), (1, 2), (1, 3)];
        let topo = TopologyCache::new(FakePlatform::numa(2, 4, &raw));
        let counts = RadAggregator::new(&topo)
            .active_cpus_per_rad()
            .expect("aggregation failed");
        assert_eq!(counts.as_slice(), &[1, 1]);
    }

    #[test]
    fn test_out_of_range_rad_skipped() {
        let raw = [(0, 0), (5, 1), (1, 2), (0, -1)];
        let topo =
            TopologyCache::new(FakePlatform::numa(2, 4, &raw).with_memory(&[(0, 10), (7, 3)]));
        let aggregator = RadAggregator::new(&topo);
        assert_eq!(aggregator.active_cpus_per_rad().expect("ok").as_slice(), &[1, 1]);
        assert_eq!(aggregator.memory_per_rad().expect("ok").as_slice(), &[10, 0]);
    }

    #[test]
    fn test_buffer_too_small_issues_no_queries() {
        let topo = TopologyCache::new(FakePlatform::numa(3, 4, TWO_RADS).with_memory(&[(0, 1)]));
        let aggregator = RadAggregator::new(&topo);

        let mut buckets = [7; 2];
        assert!(matches!(
            aggregator.count_active_cpus_per_rad(&mut buckets),
            Err(Error::BufferTooSmall {
                required: 3,
                capacity: 2
            })
        ));
        assert!(matches!(
            aggregator.sum_memory_per_rad(&mut buckets),
            Err(Error::BufferTooSmall { .. })
        ));
        assert_eq!(buckets, [7, 7]);
        assert_eq!(topo.platform().counts.table_queries(), 0);
    }

    #[test]
    fn test_platform_errors_propagate_untouched() {
        let topo = TopologyCache::new(FakePlatform::numa(2, 4, TWO_RADS).with_memory(&[(0, 1)]));
        let aggregator = RadAggregator::new(&topo);
        let mut buckets = [42; 2];

        for query in [
            FailingQuery::ActiveCpuMask,
            FailingQuery::CpuRadAssignment,
        ] {
            topo.platform().fail(Some(query));
            let err = aggregator
                .count_active_cpus_per_rad(&mut buckets)
                .expect_err("query should fail");
            assert!(matches!(err, Error::Platform(PlatformError::Io(_))));
            assert_eq!(err.to_string(), format!("platform query failed: {:?} failed", query));
            assert_eq!(buckets, [42, 42]);
        }

        topo.platform().fail(Some(FailingQuery::RadMemoryTable));
        assert!(matches!(
            aggregator.sum_memory_per_rad(&mut buckets),
            Err(Error::Platform(PlatformError::Io(_)))
        ));
        assert_eq!(buckets, [42, 42]);
    }

    #[test]
    fn test_assignment_allocation_failure_is_out_of_memory() {
        // No allocator can hold a CPU/RAD table for this many CPUs.
        let topo = TopologyCache::new(FakePlatform::numa_with_active(
            2,
            usize::MAX / 4,
            CpuMask::from_bits(0b11),
            TWO_RADS,
        ));
        let aggregator = RadAggregator::new(&topo);

        let mut buckets = [9; 2];
        assert!(matches!(
            aggregator.count_active_cpus_per_rad(&mut buckets),
            Err(Error::OutOfMemory)
        ));
        assert_eq!(buckets, [9, 9]);
        assert_eq!(
            topo.platform()
                .counts
                .cpu_rad_assignment
                .load(Ordering::SeqCst),
            0
        );

        // Nothing was cached, so the next call tries again.
        assert!(matches!(
            aggregator.active_cpus_per_rad(),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    fn test_memory_single_rad() {
        let topo = TopologyCache::new(FakePlatform::uniform(2, CpuMask::from_bits(0b11), 4096));
        let counts = RadAggregator::new(&topo)
            .memory_per_rad()
            .expect("aggregation failed");
        assert_eq!(counts.as_slice(), &[4096]);
        assert_eq!(
            topo.platform()
                .counts
                .rad_memory_table
                .load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn test_memory_segments_summed() {
        let topo = TopologyCache::new(
            FakePlatform::numa(2, 4, TWO_RADS).with_memory(&[(0, 100), (1, 50), (0, 25)]),
        );
        let counts = RadAggregator::new(&topo)
            .memory_per_rad()
            .expect("aggregation failed");
        assert_eq!(counts.as_slice(), &[125, 50]);
        assert_eq!(counts[RadId::new(1)], 50);
    }

    #[test]
    fn test_memory_table_read_fresh() {
        let topo = TopologyCache::new(FakePlatform::numa(2, 4, TWO_RADS).with_memory(&[(1, 8)]));
        let aggregator = RadAggregator::new(&topo);
        for _ in 0..3 {
            aggregator.memory_per_rad().expect("aggregation failed");
            aggregator.active_cpus_per_rad().expect("aggregation failed");
        }
        let counts = &topo.platform().counts;
        assert_eq!(counts.rad_memory_table.load(Ordering::SeqCst), 3);
        assert_eq!(counts.active_cpu_mask.load(Ordering::SeqCst), 3);
        assert_eq!(counts.cpu_rad_assignment.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rads_with_cpus_and_memory() {
        let raw = [(0, 0), (1, 1), (2, 2), (3, 3), (0, -1)];
        let topo = TopologyCache::new(
            FakePlatform::numa(4, 4, &raw)
                .with_active(CpuMask::from_bits(0b1101))
                .with_memory(&[(0, 10), (1, 10), (3, 10)]),
        );
        let rads = RadAggregator::new(&topo)
            .rads_with_cpus_and_memory()
            .expect("aggregation failed");
        assert_eq!(rads, vec![RadId::new(0), RadId::new(3)]);
    }

    proptest! {
        #[test]
        fn prop_bucket_sum_matches_wired_active_cpus(
            rads in 1u32..6,
            wiring in proptest::collection::vec(0u32..64, 0..64),
            bits in any::<u64>(),
        ) {
            // Each CPU appears once, wired to `wiring[cpu] % rads`.
            let raw: Vec<(i32, i32)> = wiring
                .iter()
                .enumerate()
                .map(|(cpu, r)| ((r % rads) as i32, cpu as i32))
                .chain(std::iter::once((0, -1)))
                .collect();
            let topo = TopologyCache::new(
                FakePlatform::numa(rads as usize, 64, &raw).with_active(CpuMask::from_bits(bits)),
            );
            let counts = RadAggregator::new(&topo)
                .active_cpus_per_rad()
                .expect("aggregation failed");

            let expected = if rads == 1 {
                bits.count_ones() as u64
            } else {
                (0..wiring.len()).filter(|cpu| (bits >> cpu) & 1 == 1).count() as u64
            };
            prop_assert_eq!(counts.len(), rads as usize);
            prop_assert_eq!(counts.total(), expected);
            prop_assert!(counts.total() <= 64);
        }
    }
}
