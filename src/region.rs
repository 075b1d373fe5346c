//! Backing memory for the shared channel area
//!
//! On real hardware the channel area is a window of external shared memory
//! (C2C or DPRAM) handed to us by the platform. For same-host deployments
//! and tests the same byte layout is hosted in a memfd- or file-backed
//! mapping. Either way the channel geometry addresses the area purely by
//! offsets, so the two are interchangeable underneath a [`RingChannel`].
//!
//! [`RingChannel`]: crate::ring::RingChannel

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, FromRawFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShmError};

/// Types of backing for the shared channel area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingType {
    /// File-backed shared memory
    FileBacked,
    /// Anonymous memory file descriptor (Linux-specific)
    #[cfg(target_os = "linux")]
    MemFd,
}

/// Configuration for creating a shared region
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Name of the region (memfd name or file name stem)
    pub name: String,
    /// Total size of the region in bytes
    pub size: usize,
    /// Backing type for the shared memory
    pub backing_type: BackingType,
    /// Optional file path for file-backed regions
    pub file_path: Option<PathBuf>,
    /// Whether to create the region if it doesn't exist
    pub create: bool,
    /// Permissions for the region (Unix permissions)
    pub permissions: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            backing_type: BackingType::FileBacked,
            file_path: None,
            create: true,
            permissions: 0o600,
        }
    }
}

/// A mapped shared memory region hosting one or more channel areas
#[derive(Debug)]
pub struct SharedRegion {
    name: String,
    size: usize,
    mmap: MmapMut,
    /// Optional file handle for file-backed regions
    _file: Option<File>,
    fd: RawFd,
}

impl SharedRegion {
    /// Create or open a shared region
    pub fn new(config: RegionConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(ShmError::invalid_config("name", "Region name cannot be empty"));
        }

        if config.size == 0 {
            return Err(ShmError::invalid_config("size", "Region size must be greater than 0"));
        }

        let (file, fd) = match config.backing_type {
            BackingType::FileBacked => {
                let path = config
                    .file_path
                    .unwrap_or_else(|| PathBuf::from(format!("/tmp/shmlink_{}", config.name)));

                let file = if config.create {
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .mode(config.permissions)
                        .open(&path)
                        .map_err(|e| ShmError::from_io(e, "Failed to create/open file"))?
                } else {
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&path)
                        .map_err(|e| ShmError::from_io(e, "Failed to open existing file"))?
                };

                if config.create {
                    file.set_len(config.size as u64)
                        .map_err(|e| ShmError::from_io(e, "Failed to set file size"))?;
                }

                let fd = file.as_raw_fd();
                (Some(file), fd)
            }
            #[cfg(target_os = "linux")]
            BackingType::MemFd => {
                let name_cstr = CString::new(config.name.clone())
                    .map_err(|_| ShmError::invalid_config("name", "Name contains null bytes"))?;

                let fd = unsafe { libc::memfd_create(name_cstr.as_ptr(), libc::MFD_CLOEXEC) };

                if fd == -1 {
                    return Err(ShmError::from_io(
                        std::io::Error::last_os_error(),
                        "Failed to create memfd",
                    ));
                }

                if unsafe { libc::ftruncate(fd, config.size as i64) } == -1 {
                    let err = std::io::Error::last_os_error();
                    unsafe {
                        libc::close(fd);
                    }
                    return Err(ShmError::from_io(err, "Failed to set memfd size"));
                }

                (None, fd)
            }
        };

        let mmap = match &file {
            Some(f) => unsafe {
                MmapOptions::new()
                    .len(config.size)
                    .map_mut(f)
                    .map_err(|e| ShmError::from_io(e, "Failed to create memory mapping"))?
            },
            None => {
                // memfd: map through a temporary File without letting it
                // close the fd on drop
                let temp_file = unsafe { File::from_raw_fd(fd) };
                let mmap = unsafe {
                    MmapOptions::new()
                        .len(config.size)
                        .map_mut(&temp_file)
                        .map_err(|e| ShmError::from_io(e, "Failed to create memory mapping"))?
                };
                std::mem::forget(temp_file);
                mmap
            }
        };

        Ok(Self {
            name: config.name,
            size: config.size,
            mmap,
            _file: file,
            fd,
        })
    }

    /// Get the raw memory slice (read-only)
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    /// Get the base pointer of the region
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Get the base pointer of the region for shared mutation
    ///
    /// # Safety
    /// The channel protocol's index-ownership discipline is the only thing
    /// guarding concurrent access through this pointer; callers must go
    /// through [`RingChannel`](crate::ring::RingChannel) or equivalent.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Get the size of the region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of the region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the file descriptor (for handing the mapping to a peer process)
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Flush changes to persistent storage (for file-backed regions)
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| ShmError::from_io(e, "Failed to flush memory mapping"))
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // memfd regions forget the temporary File above, so the fd must be
        // closed by hand
        if self._file.is_none() && self.fd != -1 {
            #[cfg(target_os = "linux")]
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}
