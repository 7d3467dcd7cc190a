use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;
use crate::platform::{Platform, RadId};
use crate::topology::TopologyCache;

/// A named, memory-resident shared region whose pages the host is asked to place on one RAD.
///
/// Processes that create a region for the same RAD in the same directory map the same backing
/// file and therefore share its contents.
pub struct RadRegion {
    rad: RadId,
    path: PathBuf,
    mmap: MmapMut,
}

impl std::fmt::Debug for RadRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadRegion")
            .field("rad", &self.rad)
            .field("path", &self.path)
            .field("len", &self.mmap.len())
            .finish()
    }
}

impl RadRegion {
    pub fn name_for(rad: RadId) -> String {
        format!("rad_region_{}", rad)
    }

    /// Creates (or reopens) the region of `rad` under `dir`, `len` bytes long.
    ///
    /// On a multi-RAD system a preferred-RAD placement hint is attached to the mapping. The host
    /// may ignore it; a rejected hint is logged and the region is still returned.
    pub fn create<P: Platform>(
        topology: &TopologyCache<P>,
        rad: RadId,
        len: u64,
        dir: impl AsRef<Path>,
    ) -> Result<Self> {
        topology.check_rad(rad)?;
        if len == 0 {
            let err = io::Error::new(io::ErrorKind::InvalidInput, "region length must be non-zero");
            return Err(err.into());
        }

        let path = dir.as_ref().join(Self::name_for(rad));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }

        let mut mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };

        if topology.max_rads() > 1 {
            if let Err(err) = prefer_rad(&mut mmap, rad) {
                warn!("RAD {} placement hint rejected for '{}': {}", rad, path.display(), err);
            }
        }
        if let Err(err) = mmap.lock() {
            warn!("failed to lock region '{}': {:?}", path.display(), err);
        }

        info!("mapped {} byte region '{}' on RAD {}", len, path.display(), rad);
        Ok(Self { rad, path, mmap })
    }

    pub fn rad(&self) -> RadId {
        self.rad
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Increments the native-endian `u64` at every `stride` bytes and returns how many words were
    /// touched.
    pub fn touch(&mut self, stride: usize) -> usize {
        const WORD: usize = std::mem::size_of::<u64>();
        let stride = stride.max(WORD);

        let mut touched = 0;
        for offset in (0..self.mmap.len()).step_by(stride) {
            if let Some(bytes) = self.mmap.get_mut(offset..offset + WORD) {
                let mut word = [0u8; WORD];
                word.copy_from_slice(bytes);
                let value = u64::from_ne_bytes(word).wrapping_add(1);
                bytes.copy_from_slice(&value.to_ne_bytes());
                touched += 1;
            }
        }
        debug!("touched {} words of '{}'", touched, self.path.display());
        touched
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn prefer_rad(mmap: &mut MmapMut, rad: RadId) -> io::Result<()> {
    // linux/mempolicy.h
    const MPOL_PREFERRED: libc::c_int = 1;
    const WORD_BITS: usize = 8 * std::mem::size_of::<libc::c_ulong>();

    let mut nodemask: Vec<libc::c_ulong> = vec![0; rad.index() / WORD_BITS + 1];
    nodemask[rad.index() / WORD_BITS] |= 1 << (rad.index() % WORD_BITS);
    let maxnode = nodemask.len() * WORD_BITS + 1;

    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            mmap.as_mut_ptr(),
            mmap.len(),
            MPOL_PREFERRED,
            nodemask.as_ptr(),
            maxnode,
            0 as libc::c_uint,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("preferred RAD {} for {} bytes", rad, mmap.len());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn prefer_rad(_mmap: &mut MmapMut, _rad: RadId) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no RAD placement hints on this host"))
}
