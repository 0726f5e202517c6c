//! Users need to register memory they allocated as memory region for accessing it later.
use rdma_mummy_sys::{ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use std::{io, ptr::NonNull, sync::Arc};

use super::protection_domain::ProtectionDomain;
use super::AccessFlags;

/// Error returned by [`ProtectionDomain::reg_mr`] for registering a new RDMA MR.
#[derive(Debug, thiserror::Error)]
#[error("failed to register memory region")]
#[non_exhaustive]
pub struct RegisterMemoryRegionError(#[from] pub RegisterMemoryRegionErrorKind);

/// The enum type for [`RegisterMemoryRegionError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum RegisterMemoryRegionErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`PinnedBuffer::zeroed`] for allocating a page-aligned buffer.
#[derive(Debug, thiserror::Error)]
#[error("failed to allocate pinned buffer of {len} bytes")]
#[non_exhaustive]
pub struct AllocateBufferError {
    pub len: usize,
    pub source: io::Error,
}

/// A registered memory region abstraction that wraps an RDMA memory region.
#[derive(Debug)]
pub struct MemoryRegion {
    mr: NonNull<ibv_mr>,
    _pd: Arc<ProtectionDomain>,
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_mut());
        }
    }
}

impl MemoryRegion {
    /// Returns the RDMA local key.
    pub fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref().lkey }
    }

    /// Returns the RDMA remote key, only meaningful if the region was registered with remote
    /// access flags.
    pub fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref().rkey }
    }

    /// Returns the length of the registered region.
    pub fn region_len(&self) -> usize {
        unsafe { self.mr.as_ref().length }
    }

    /// Returns the starting address of the registered region.
    pub fn get_ptr(&self) -> usize {
        unsafe { self.mr.as_ref().addr as _ }
    }

    /// # Safety
    ///
    /// Return the handle of the memory region.
    /// We mark this method unsafe because the lifetime of `ibv_mr` is not associated
    /// with the return value.
    pub unsafe fn mr(&self) -> NonNull<ibv_mr> {
        self.mr
    }

    pub(crate) unsafe fn register(
        pd: Arc<ProtectionDomain>, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<Self, RegisterMemoryRegionError> {
        let mr = unsafe { ibv_reg_mr(pd.pd.as_ptr(), ptr as _, len, access.into()) };

        if mr.is_null() {
            return Err(RegisterMemoryRegionErrorKind::Ibverbs(io::Error::last_os_error()).into());
        }

        Ok(Self {
            mr: NonNull::new(mr).unwrap(),
            _pd: pd,
        })
    }
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

/// A page-aligned heap buffer suitable for registration as a [`MemoryRegion`]. The adapter
/// accesses registered memory at page granularity, so both data-plane buffers and receive
/// buffers are carved out of these.
#[derive(Debug)]
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl PinnedBuffer {
    /// Allocate `len` zero-filled bytes aligned to the page size.
    pub fn zeroed(len: usize) -> Result<Self, AllocateBufferError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut ptr = std::ptr::null_mut();

        let ret = unsafe { libc::posix_memalign(&mut ptr, page_size, len) };
        if ret != 0 {
            return Err(AllocateBufferError {
                len,
                source: io::Error::from_raw_os_error(ret),
            });
        }

        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, len) };

        Ok(PinnedBuffer {
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            len,
        })
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `data` into the front of the buffer, returning how many bytes were written.
    pub fn fill_from(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.len);
        self.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        n
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr().cast()) };
    }
}

unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_buffer_alignment_and_zeroing() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let buf = PinnedBuffer::zeroed(4096).unwrap();

        assert_eq!(buf.addr() % page_size, 0);
        assert_eq!(buf.len(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pinned_buffer_fill_from() {
        let mut buf = PinnedBuffer::zeroed(8).unwrap();

        assert_eq!(buf.fill_from(b"abc"), 3);
        assert_eq!(&buf.as_slice()[..4], b"abc\0");

        // Oversized payloads are truncated to the buffer length.
        assert_eq!(buf.fill_from(&[0x7f; 100]), 8);
        assert!(buf.as_slice().iter().all(|&b| b == 0x7f));
    }
}
