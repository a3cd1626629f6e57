//! Shared IQ buffer.
//!
//! A named POSIX shared-memory segment that receives the decoded samples of
//! every sequence in an integration, laid out back to back as
//! `[main samples][back samples]` per sequence. The controller-side consumer
//! maps the same segment by name.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from allocating a shared segment.
#[derive(Debug, Error)]
pub enum IqBufferError {
    #[error("IQ buffer size is zero")]
    ZeroSize,

    #[error("shm_open {name}: {source}")]
    Open { name: String, source: nix::Error },

    #[error("resize {name} to {size} bytes: {source}")]
    Resize { name: String, size: usize, source: nix::Error },

    #[error("mmap {name}: {source}")]
    Map { name: String, source: nix::Error },
}

impl IqBufferError {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ZeroSize => None,
            Self::Open { source, .. } | Self::Resize { source, .. } | Self::Map { source, .. } => {
                Some(*source as i32)
            }
        }
    }
}

/// A sequence that did not fit. Nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("IQ buffer overrun: {len} bytes at offset {offset} exceed capacity {capacity}")]
pub struct Overrun {
    pub offset: usize,
    pub len: usize,
    pub capacity: usize,
}

enum Backing {
    Shared { ptr: NonNull<c_void>, _fd: OwnedFd },
    Heap(Vec<u8>),
}

/// Byte region shared with the controller. One writer: the integration loop.
pub struct IqBuffer {
    /// Segment name without the leading slash, as published downstream.
    name: String,
    size: usize,
    backing: Option<Backing>,
}

impl IqBuffer {
    /// Segment name used for radar `rnum`, channel `cnum`.
    pub fn segment_name(rnum: i32, cnum: i32) -> String {
        format!("IQBuff_ROS_{rnum}_{cnum}")
    }

    /// Create (or reuse) the shared segment `name` and map `size` bytes of it.
    pub fn allocate(name: &str, size: usize) -> Result<Self, IqBufferError> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::{MapFlags, ProtFlags, mmap, shm_open};
        use nix::sys::stat::Mode;

        let len = NonZeroUsize::new(size).ok_or(IqBufferError::ZeroSize)?;
        let path = format!("/{name}");
        let fd = shm_open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|source| IqBufferError::Open { name: name.to_string(), source })?;

        nix::unistd::ftruncate(&fd, size as i64).map_err(|source| IqBufferError::Resize {
            name: name.to_string(),
            size,
            source,
        })?;

        // SAFETY: fresh mapping of a descriptor we own; no existing Rust
        // references alias it.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| IqBufferError::Map { name: name.to_string(), source })?;

        debug!(name, size, "IQ buffer mapped");
        Ok(Self {
            name: name.to_string(),
            size,
            backing: Some(Backing::Shared { ptr, _fd: fd }),
        })
    }

    /// Process-private buffer with the same write semantics.
    pub fn anonymous(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            backing: Some(Backing::Heap(vec![0; size])),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn is_released(&self) -> bool {
        self.backing.is_none()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: the mapping is `size` bytes long and lives until release.
            Some(Backing::Shared { ptr, .. }) => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr() as *const u8, self.size)
            },
            Some(Backing::Heap(v)) => v,
            None => &[],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            // SAFETY: as above, and `&mut self` guarantees a single writer.
            Some(Backing::Shared { ptr, .. }) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u8, self.size)
            },
            Some(Backing::Heap(v)) => v,
            None => &mut [],
        }
    }

    /// Copy `main` then `back` to `offset`. Returns the bytes written.
    ///
    /// When the sequence does not fit, nothing is written.
    pub fn write_sequence(&mut self, offset: usize, main: &[u32], back: &[u32]) -> Result<usize, Overrun> {
        let len = (main.len() + back.len()) * 4;
        let capacity = if self.is_released() { 0 } else { self.size };
        if offset.checked_add(len).is_none_or(|end| end > capacity) {
            return Err(Overrun { offset, len, capacity });
        }
        let dest = &mut self.as_mut_slice()[offset..offset + len];
        for (chunk, s) in dest.chunks_exact_mut(4).zip(main.iter().chain(back)) {
            chunk.copy_from_slice(&s.to_ne_bytes());
        }
        Ok(len)
    }

    /// Unmap and unlink. Safe to call more than once.
    pub fn release(&mut self) {
        match self.backing.take() {
            Some(Backing::Shared { ptr, _fd }) => {
                // SAFETY: ptr/size come from the successful mmap in allocate.
                if let Err(e) = unsafe { nix::sys::mman::munmap(ptr, self.size) } {
                    warn!(name = %self.name, "munmap failed: {e}");
                }
                if let Err(e) = nix::sys::mman::shm_unlink(format!("/{}", self.name).as_str()) {
                    warn!(name = %self.name, "shm_unlink failed: {e}");
                }
                debug!(name = %self.name, "IQ buffer released");
            }
            Some(Backing::Heap(_)) | None => {}
        }
    }
}

impl Drop for IqBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for IqBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IqBuffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("released", &self.is_released())
            .finish()
    }
}
