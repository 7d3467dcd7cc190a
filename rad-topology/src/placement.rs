use std::process::{Child, Command};

use log::{debug, info};

use crate::error::Result;
use crate::platform::{CpuId, Platform, RadId};
use crate::topology::TopologyCache;

/// Spawns `command` with its home RAD set to `rad`.
///
/// On a multi-RAD system the child may only run on the CPUs wired to `rad`. On a single-RAD system
/// the command is spawned unchanged. Scheduling within the RAD is left to the host.
pub fn spawn_on_rad<P: Platform>(
    topology: &TopologyCache<P>,
    rad: RadId,
    command: &mut Command,
) -> Result<Child> {
    topology.check_rad(rad)?;

    if topology.max_rads() > 1 {
        let cpus = topology.cpus_of_rad(rad)?;
        debug!("restricting child to RAD {} CPUs {:?}", rad, cpus);
        restrict_to_cpus(command, cpus);
    }

    let child = command.spawn()?;
    info!("spawned process {} on RAD {}", child.id(), rad);
    Ok(child)
}

/// Affinity mask covering `cpus`, sized to the highest CPU instead of `CPU_SETSIZE`.
#[cfg(target_os = "linux")]
fn affinity_mask(cpus: &[CpuId]) -> Vec<libc::c_ulong> {
    const WORD_BITS: usize = 8 * std::mem::size_of::<libc::c_ulong>();

    let len = cpus.iter().map(|cpu| cpu.index() / WORD_BITS + 1).max().unwrap_or(1);
    let mut mask = vec![0; len];
    for cpu in cpus {
        mask[cpu.index() / WORD_BITS] |= 1 << (cpu.index() % WORD_BITS);
    }
    mask
}

#[cfg(target_os = "linux")]
fn restrict_to_cpus(command: &mut Command, cpus: Vec<CpuId>) {
    use std::os::unix::process::CommandExt;

    let mask = affinity_mask(&cpus);
    let size = mask.len() * std::mem::size_of::<libc::c_ulong>();

    // Runs in the forked child, so only async-signal-safe calls are allowed.
    unsafe {
        command.pre_exec(move || {
            let set = mask.as_ptr() as *const libc::cpu_set_t;
            if libc::sched_setaffinity(0, size, set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn restrict_to_cpus(_command: &mut Command, cpus: Vec<CpuId>) {
    log::warn!("CPU affinity not supported here, ignoring {} RAD CPUs", cpus.len());
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    use crate::error::Error;
    use crate::platform::CpuMask;
    use crate::test_helper::FakePlatform;

    #[test]
    fn test_spawn_single_rad() {
        fil_logger::maybe_init();
        let topo = TopologyCache::new(FakePlatform::uniform(1, CpuMask::from_bits(1), 1));
        let status = spawn_on_rad(&topo, RadId::new(0), &mut Command::new("true"))
            .expect("spawn failed")
            .wait()
            .expect("wait failed");
        assert!(status.success());
    }

    #[test]
    fn test_spawn_pins_to_rad_cpus() {
        // Wire the CPU we are running on to RAD 0 so the mask is allowed by any cpuset.
        let cpu = unsafe { libc::sched_getcpu() };
        assert!(cpu >= 0);
        let raw = [(0, cpu), (1, cpu + 1), (0, -1)];
        let topo = TopologyCache::new(FakePlatform::numa(2, cpu as usize + 2, &raw));

        let output = spawn_on_rad(
            &topo,
            RadId::new(0),
            Command::new("grep")
                .arg("Cpus_allowed_list")
                .arg("/proc/self/status")
                .stdout(std::process::Stdio::piped()),
        )
        .expect("spawn failed")
        .wait_with_output()
        .expect("wait failed");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success());
        assert_eq!(
            stdout.split_whitespace().last(),
            Some(cpu.to_string().as_str()),
            "unexpected affinity: {}",
            stdout
        );
    }

    #[test]
    fn test_affinity_mask_beyond_cpu_setsize() {
        const WORD_BITS: usize = 8 * std::mem::size_of::<libc::c_ulong>();

        let mask = affinity_mask(&[CpuId::new(1), CpuId::new(1500)]);
        assert_eq!(mask.len(), 1500 / WORD_BITS + 1);
        assert_eq!(mask[0], 0b10);
        assert_eq!(mask[1500 / WORD_BITS], 1 << (1500 % WORD_BITS));
        assert_eq!(mask.iter().map(|w| w.count_ones()).sum::<u32>(), 2);
    }

    #[test]
    fn test_spawn_with_high_cpu_ids() {
        // CPU 1500 is wired to RAD 0 but absent from the host; only the current CPU remains.
        let cpu = unsafe { libc::sched_getcpu() };
        assert!(cpu >= 0);
        let raw = [(0, cpu), (0, 1500), (1, cpu + 1), (0, -1)];
        let topo = TopologyCache::new(FakePlatform::numa(2, 1501.max(cpu as usize + 2), &raw));

        let output = spawn_on_rad(
            &topo,
            RadId::new(0),
            Command::new("grep")
                .arg("Cpus_allowed_list")
                .arg("/proc/self/status")
                .stdout(std::process::Stdio::piped()),
        )
        .expect("spawn failed")
        .wait_with_output()
        .expect("wait failed");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert_eq!(stdout.split_whitespace().last(), Some(cpu.to_string().as_str()));
    }

    #[test]
    fn test_spawn_rejects_unknown_rad() {
        let topo = TopologyCache::new(FakePlatform::numa(2, 2, &[(0, 0), (1, 1), (0, -1)]));
        let err = spawn_on_rad(&topo, RadId::new(2), &mut Command::new("true"))
            .expect_err("RAD 2 does not exist");
        assert!(matches!(err, Error::InvalidRad { .. }));
    }
}
