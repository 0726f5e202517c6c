//! A protection domain is used to associate [`QueuePair`]s with [`MemoryRegion`]s and
//! [`MemoryWindow`]s, as a means for enabling and controlling network adapter access to Host
//! System memory.
//!
//! [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
//! [`MemoryRegion`]: crate::ibverbs::memory_region::MemoryRegion
//! [`MemoryWindow`]: crate::ibverbs::memory_window::MemoryWindow
//!
use rdma_mummy_sys::{ibv_dealloc_pd, ibv_pd};
use std::ptr::NonNull;
use std::sync::Arc;

use super::{
    device_context::DeviceContext,
    memory_region::{MemoryRegion, RegisterMemoryRegionError},
    memory_window::{AllocateMemoryWindowError, MemoryWindow, MemoryWindowKind},
    queue_pair::QueuePairBuilder,
    AccessFlags,
};

/// A protection domain to create RDMA QPs, MRs and MWs on, associating them together.
#[derive(Debug)]
pub struct ProtectionDomain {
    pub(crate) pd: NonNull<ibv_pd>,
    _dev_ctx: Arc<DeviceContext>,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd.as_mut());
        }
    }
}

impl ProtectionDomain {
    pub(crate) fn new(dev_ctx: Arc<DeviceContext>, pd: NonNull<ibv_pd>) -> Self {
        ProtectionDomain {
            pd,
            _dev_ctx: dev_ctx,
        }
    }

    /// Register a memory region over a buffer that was allocated outside this module.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is valid for `len` bytes
    /// and that the memory remains accessible and unmodified as needed.
    pub unsafe fn reg_mr(
        self: &Arc<Self>, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<MemoryRegion, RegisterMemoryRegionError> {
        MemoryRegion::register(Arc::clone(self), ptr, len, access)
    }

    /// Allocate an unbound memory window on this protection domain. The window only gets a
    /// usable remote key once bound to a registered region.
    pub fn alloc_mw(self: &Arc<Self>, kind: MemoryWindowKind) -> Result<MemoryWindow, AllocateMemoryWindowError> {
        MemoryWindow::alloc(Arc::clone(self), kind)
    }

    /// Create a [`QueuePairBuilder`] for building QPs on this protection domain later.
    pub fn create_qp_builder(self: &Arc<Self>) -> QueuePairBuilder {
        QueuePairBuilder::new(self)
    }
}
