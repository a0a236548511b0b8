//! Named POSIX shared-memory regions used to move bulk payloads between
//! the gateway and worker processes without copying them through the IPC
//! channel.
//!
//! The producer creates a region, fills it, and the consumer opens it by
//! name. When remove-on-destruction is enabled, dropping the region
//! unlinks its name; existing mappings stay readable, which is what lets
//! the consumer unlink eagerly while it still holds the bytes.

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm name {0:?} is not valid")]
    BadName(String),
    #[error("shm create failed: {0}")]
    Create(#[source] io::Error),
    #[error("shm open failed: {0}")]
    Open(#[source] io::Error),
    #[error("shm map failed: {0}")]
    Map(#[source] io::Error),
}

/// Name of the input region for a call, in the POSIX shm namespace.
pub fn func_call_input_name(full_call_id: u64) -> String {
    format!("func_call_input_{full_call_id}")
}

/// Name of the output region for a call.
pub fn func_call_output_name(full_call_id: u64) -> String {
    format!("func_call_output_{full_call_id}")
}

/// A mapped, named shared-memory region.
///
/// Zero-size regions are legal: the backing object exists but no mapping
/// is made and [`as_slice`](Self::as_slice) is empty.
pub struct ShmRegion {
    ptr: Option<NonNull<u8>>,
    size: usize,
    name: String,
    // Kept so the mapping's fd outlives the mmap call on all platforms.
    _file: File,
    remove_on_destruction: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates a new region of `size` bytes. Fails if the name exists.
    /// A partially-created region is unlinked before the error returns.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let posix_name = posix_name(name)?;
        let fd = shm_open(
            posix_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| ShmError::Create(errno_to_io(errno)))?;
        let file = File::from(fd);
        if let Err(err) = file.set_len(size as u64) {
            let _ = shm_unlink(posix_name.as_str());
            return Err(ShmError::Create(err));
        }
        match Self::map(file, name.to_string(), size) {
            Ok(region) => Ok(region),
            Err(err) => {
                let _ = shm_unlink(posix_name.as_str());
                Err(err)
            }
        }
    }

    /// Opens an existing region; its size comes from the backing object.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let posix_name = posix_name(name)?;
        let fd: OwnedFd = shm_open(posix_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|errno| ShmError::Open(errno_to_io(errno)))?;
        let file = File::from(fd);
        let size = file.metadata().map_err(ShmError::Open)?.len() as usize;
        Self::map(file, name.to_string(), size)
    }

    fn map(file: File, name: String, size: usize) -> Result<Self, ShmError> {
        let ptr = match NonZeroUsize::new(size) {
            Some(len) => {
                let raw = unsafe {
                    mmap(
                        None,
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_SHARED,
                        file.as_fd(),
                        0,
                    )
                }
                .map_err(|errno| ShmError::Map(errno_to_io(errno)))?;
                Some(raw.cast())
            }
            None => None,
        };
        Ok(Self {
            ptr,
            size,
            name,
            _file: file,
            remove_on_destruction: false,
        })
    }

    /// After this, dropping the region unlinks its name.
    pub fn enable_remove_on_destruction(&mut self) {
        self.remove_on_destruction = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) },
            None => &mut [],
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            let _ = unsafe { munmap(ptr.cast(), self.size) };
        }
        if self.remove_on_destruction {
            if let Ok(posix_name) = posix_name(&self.name) {
                let _ = shm_unlink(posix_name.as_str());
            }
        }
    }
}

fn posix_name(name: &str) -> Result<String, ShmError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(ShmError::BadName(name.to_string()));
    }
    Ok(format!("/{name}"))
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn unique_name(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "faasgate_test_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_write_open_read_round_trips() {
        let name = unique_name("roundtrip");
        let payload = vec![0xabu8; 4096];
        let mut producer = ShmRegion::create(&name, payload.len()).unwrap();
        producer.as_mut_slice().copy_from_slice(&payload);

        let mut consumer = ShmRegion::open(&name).unwrap();
        consumer.enable_remove_on_destruction();
        assert_eq!(consumer.size(), payload.len());
        assert_eq!(consumer.as_slice(), payload.as_slice());
        drop(consumer);

        // Name is gone once the remove-on-destruction owner dropped it.
        assert!(matches!(ShmRegion::open(&name), Err(ShmError::Open(_))));
    }

    #[test]
    fn create_rejects_existing_name() {
        let name = unique_name("exclusive");
        let mut first = ShmRegion::create(&name, 16).unwrap();
        first.enable_remove_on_destruction();
        assert!(matches!(
            ShmRegion::create(&name, 16),
            Err(ShmError::Create(_))
        ));
    }

    #[test]
    fn zero_size_region_is_legal() {
        let name = unique_name("empty");
        let mut region = ShmRegion::create(&name, 0).unwrap();
        region.enable_remove_on_destruction();
        assert_eq!(region.size(), 0);
        assert!(region.as_slice().is_empty());
    }

    #[test]
    fn open_missing_region_fails() {
        assert!(matches!(
            ShmRegion::open(&unique_name("missing")),
            Err(ShmError::Open(_))
        ));
    }

    #[test]
    fn names_are_derived_from_the_full_call_id() {
        assert_eq!(func_call_input_name(42), "func_call_input_42");
        assert_eq!(func_call_output_name(42), "func_call_output_42");
    }
}
