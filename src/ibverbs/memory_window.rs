//! Memory windows grant remote peers access to a sub-range of a registered
//! [`MemoryRegion`], through a remote key that can be replaced or revoked at any time by
//! rebinding the window. Binding is a send-queue operation, so a bind only takes effect once
//! its completion has been observed on the QP's send CQ.
use rdma_mummy_sys::{
    ibv_alloc_mw, ibv_bind_mw, ibv_dealloc_mw, ibv_inc_rkey, ibv_mw, ibv_mw_bind, ibv_mw_bind_info, ibv_mw_type,
};
use std::{io, ptr::NonNull, sync::Arc};

use super::memory_region::MemoryRegion;
use super::protection_domain::ProtectionDomain;
use super::queue_pair::{QueuePair, WorkRequestFlags};
use super::AccessFlags;

/// Error returned by [`ProtectionDomain::alloc_mw`] for allocating a new RDMA MW.
#[derive(Debug, thiserror::Error)]
#[error("failed to allocate memory window")]
#[non_exhaustive]
pub struct AllocateMemoryWindowError(#[from] pub AllocateMemoryWindowErrorKind);

/// The enum type for [`AllocateMemoryWindowError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AllocateMemoryWindowErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`MemoryWindow::bind`] and [`MemoryWindow::begin_bind`].
#[derive(Debug, thiserror::Error)]
#[error("failed to bind memory window")]
#[non_exhaustive]
pub struct BindMemoryWindowError(#[from] pub BindMemoryWindowErrorKind);

/// The enum type for [`BindMemoryWindowError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum BindMemoryWindowErrorKind {
    #[error("another bind is still in flight, poll its completion first")]
    BindInFlight,
    #[error("operation not supported for window kind {0:?}")]
    WrongKind(MemoryWindowKind),
    #[error("bind range [{addr}, {addr}+{length}) is outside the registered region")]
    OutOfRegion { addr: u64, length: usize },
    Ibverbs(#[from] io::Error),
}

/// The kind of a memory window, determining how binds are issued.
///
/// Type 1 windows are bound through a dedicated synchronous verb, type 2 windows are bound by
/// posting a work request onto the send queue. Both styles signal a completion for the bind.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWindowKind {
    Type1 = ibv_mw_type::IBV_MW_TYPE_1,
    Type2 = ibv_mw_type::IBV_MW_TYPE_2,
}

/// A revocable remote-access capability over a sub-range of a [`MemoryRegion`].
///
/// A freshly allocated window is unbound and exposes no remote key. Every bind produces a new
/// key and invalidates the previous one; a bind of length zero revokes remote access without
/// deallocating the window. At most one bind may be outstanding at a time, and the caller has
/// to confirm each bind's completion through [`MemoryWindow::complete_bind`] before the new
/// key is advertised.
#[derive(Debug)]
pub struct MemoryWindow {
    mw: NonNull<ibv_mw>,
    kind: MemoryWindowKind,
    // rkey advertised to the peer, None while unbound or revoked
    rkey: Option<u32>,
    // (rkey, length) of the bind whose completion we are waiting for
    pending: Option<(u32, usize)>,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for MemoryWindow {}
unsafe impl Sync for MemoryWindow {}

impl Drop for MemoryWindow {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_mw(self.mw.as_mut());
        }
    }
}

impl MemoryWindow {
    pub(crate) fn alloc(pd: Arc<ProtectionDomain>, kind: MemoryWindowKind) -> Result<Self, AllocateMemoryWindowError> {
        let mw = unsafe { ibv_alloc_mw(pd.pd.as_ptr(), kind as u32) };

        if mw.is_null() {
            return Err(AllocateMemoryWindowErrorKind::Ibverbs(io::Error::last_os_error()).into());
        }

        Ok(MemoryWindow {
            mw: unsafe { NonNull::new_unchecked(mw) },
            kind,
            rkey: None,
            pending: None,
            _pd: pd,
        })
    }

    pub fn kind(&self) -> MemoryWindowKind {
        self.kind
    }

    /// The remote key currently granting access, `None` while the window is unbound or
    /// revoked. Only updated by [`MemoryWindow::complete_bind`].
    pub fn rkey(&self) -> Option<u32> {
        self.rkey
    }

    /// Whether a bind has been issued whose completion has not been confirmed yet.
    pub fn bind_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    /// The key the next type 2 bind work request should carry, derived from the current key
    /// by bumping its tag bits.
    pub fn next_rkey(&self) -> u32 {
        unsafe { ibv_inc_rkey(self.mw.as_ref().rkey) }
    }

    /// # Safety
    ///
    /// Return the handle of the memory window.
    /// We mark this method unsafe because the lifetime of `ibv_mw` is not associated
    /// with the return value.
    pub unsafe fn mw(&self) -> NonNull<ibv_mw> {
        self.mw
    }

    /// Bind a type 1 window over `[addr, addr + length)` of `region` through the synchronous
    /// verb, issuing a signaled bind on `qp`'s send queue. The caller must still poll the
    /// completion carrying `wr_id` and then call [`MemoryWindow::complete_bind`].
    ///
    /// A `length` of zero revokes the current remote key without establishing a new one.
    pub fn bind(
        &mut self, qp: &QueuePair, region: &MemoryRegion, addr: u64, length: usize, access: AccessFlags, wr_id: u64,
    ) -> Result<(), BindMemoryWindowError> {
        if self.kind != MemoryWindowKind::Type1 {
            return Err(BindMemoryWindowErrorKind::WrongKind(self.kind).into());
        }
        self.check_range(region, addr, length)?;
        self.reserve_bind()?;

        let mut mw_bind = ibv_mw_bind {
            wr_id,
            send_flags: WorkRequestFlags::Signaled.bits(),
            bind_info: ibv_mw_bind_info {
                mr: if length == 0 {
                    std::ptr::null_mut()
                } else {
                    unsafe { region.mr().as_ptr() }
                },
                addr: if length == 0 { 0 } else { addr },
                length: length as u64,
                mw_access_flags: if length == 0 { 0 } else { access.bits as u32 },
            },
        };

        let ret = unsafe { ibv_bind_mw(qp.qp().as_ptr(), self.mw.as_ptr(), &mut mw_bind) };
        if ret != 0 {
            self.pending = None;
            return Err(BindMemoryWindowErrorKind::Ibverbs(io::Error::from_raw_os_error(ret)).into());
        }

        // The verb refreshed mw->rkey in place, it becomes valid with the completion.
        self.pending = Some((unsafe { self.mw.as_ref().rkey }, length));
        Ok(())
    }

    /// Record a bind posted onto the send queue for a type 2 window. Called by the post send
    /// guard when the bind work request is set up, before the guard is posted.
    pub(crate) fn begin_bind(&mut self, rkey: u32, length: usize) -> Result<(), BindMemoryWindowError> {
        if self.kind != MemoryWindowKind::Type2 {
            return Err(BindMemoryWindowErrorKind::WrongKind(self.kind).into());
        }
        self.reserve_bind()?;
        self.pending = Some((rkey, length));
        Ok(())
    }

    /// Confirm the outstanding bind after its successful completion was polled. Returns the
    /// newly valid remote key, or `None` if the bind was a zero-length revocation (or if no
    /// bind was in flight).
    pub fn complete_bind(&mut self) -> Option<u32> {
        match self.pending.take() {
            Some((rkey, length)) if length > 0 => {
                self.rkey = Some(rkey);
                self.rkey
            }
            Some(_) => {
                self.rkey = None;
                None
            }
            None => None,
        }
    }

    /// Drop the record of a bind that failed to post, freeing the window for another attempt.
    pub(crate) fn abort_bind(&mut self) {
        self.pending = None;
    }

    fn reserve_bind(&self) -> Result<(), BindMemoryWindowError> {
        if self.pending.is_some() {
            return Err(BindMemoryWindowErrorKind::BindInFlight.into());
        }
        Ok(())
    }

    fn check_range(&self, region: &MemoryRegion, addr: u64, length: usize) -> Result<(), BindMemoryWindowError> {
        if length == 0 {
            return Ok(());
        }
        let start = region.get_ptr() as u64;
        let end = start + region.region_len() as u64;
        if addr < start || addr + length as u64 > end {
            return Err(BindMemoryWindowErrorKind::OutOfRegion { addr, length }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_rkey_bumps_tag_only() {
        assert_eq!(unsafe { ibv_inc_rkey(0x1234_5600) }, 0x1234_5601);
        // The consumer tag wraps within the low byte, the index bits stay put.
        assert_eq!(unsafe { ibv_inc_rkey(0x1234_56ff) }, 0x1234_5600);
    }
}
