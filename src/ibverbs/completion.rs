//! Completion queues report the fate of posted work requests. Every signaled
//! send-queue operation (write, write-with-immediate, window bind) and every consumed receive
//! buffer shows up here as one work completion, attributed to the caller-assigned wr_id.
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{io, ptr};
use std::{marker::PhantomData, mem::MaybeUninit};

use bitmask_enum::bitmask;

use super::device_context::DeviceContext;
use rdma_mummy_sys::{
    ibv_comp_channel, ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex, ibv_create_cq_ex, ibv_create_cq_wc_flags,
    ibv_destroy_cq, ibv_end_poll, ibv_next_poll, ibv_pd, ibv_poll_cq_attr, ibv_start_poll, ibv_wc_flags,
    ibv_wc_opcode, ibv_wc_read_byte_len, ibv_wc_read_imm_data, ibv_wc_read_opcode, ibv_wc_read_vendor_err,
    ibv_wc_read_wc_flags, ibv_wc_status,
};

#[derive(Debug, thiserror::Error)]
#[error("failed to create completion queue")]
#[non_exhaustive]
pub struct CreateCompletionQueueError(#[from] pub CreateCompletionQueueErrorKind);

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateCompletionQueueErrorKind {
    Ibverbs(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PollCompletionQueueError {
    #[error("poll completion queue failed")]
    Ibverbs(#[from] io::Error),
    #[error("completion queue is empty")]
    CompletionQueueEmpty,
}

/// Status reported by the adapter for one work completion. Anything other than
/// [`CompletionStatus::Success`] means the associated work request failed and, on a connected
/// QP, usually leaves the QP in the error state with the rest of the queue flushed.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success = ibv_wc_status::IBV_WC_SUCCESS,
    LocalLengthError = ibv_wc_status::IBV_WC_LOC_LEN_ERR,
    LocalQueuePairOperationError = ibv_wc_status::IBV_WC_LOC_QP_OP_ERR,
    LocalProtectionError = ibv_wc_status::IBV_WC_LOC_PROT_ERR,
    WorkRequestFlushedError = ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
    MemoryWindowBindError = ibv_wc_status::IBV_WC_MW_BIND_ERR,
    BadResponseError = ibv_wc_status::IBV_WC_BAD_RESP_ERR,
    LocalAccessError = ibv_wc_status::IBV_WC_LOC_ACCESS_ERR,
    RemoteInvalidRequestError = ibv_wc_status::IBV_WC_REM_INV_REQ_ERR,
    RemoteAccessError = ibv_wc_status::IBV_WC_REM_ACCESS_ERR,
    RemoteOperationError = ibv_wc_status::IBV_WC_REM_OP_ERR,
    RetryCounterExceededError = ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
    ResponderNotReadyRetryCounterExceededError = ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
    RemoteAbortedError = ibv_wc_status::IBV_WC_REM_ABORT_ERR,
    FatalError = ibv_wc_status::IBV_WC_FATAL_ERR,
    ResponseTimeoutError = ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR,
    GeneralError = ibv_wc_status::IBV_WC_GENERAL_ERR,
    // Catch-all so polling never dies on a status this crate does not model.
    Unknown = u32::MAX,
}

impl From<u32> for CompletionStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => CompletionStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => CompletionStatus::LocalLengthError,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => CompletionStatus::LocalQueuePairOperationError,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => CompletionStatus::LocalProtectionError,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => CompletionStatus::WorkRequestFlushedError,
            ibv_wc_status::IBV_WC_MW_BIND_ERR => CompletionStatus::MemoryWindowBindError,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => CompletionStatus::BadResponseError,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => CompletionStatus::LocalAccessError,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => CompletionStatus::RemoteInvalidRequestError,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => CompletionStatus::RemoteAccessError,
            ibv_wc_status::IBV_WC_REM_OP_ERR => CompletionStatus::RemoteOperationError,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => CompletionStatus::RetryCounterExceededError,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => CompletionStatus::ResponderNotReadyRetryCounterExceededError,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => CompletionStatus::RemoteAbortedError,
            ibv_wc_status::IBV_WC_FATAL_ERR => CompletionStatus::FatalError,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => CompletionStatus::ResponseTimeoutError,
            ibv_wc_status::IBV_WC_GENERAL_ERR => CompletionStatus::GeneralError,
            _ => CompletionStatus::Unknown,
        }
    }
}

/// The operation a work completion was generated for.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOpcode {
    Send = ibv_wc_opcode::IBV_WC_SEND,
    Write = ibv_wc_opcode::IBV_WC_RDMA_WRITE,
    Read = ibv_wc_opcode::IBV_WC_RDMA_READ,
    BindMemoryWindow = ibv_wc_opcode::IBV_WC_BIND_MW,
    Receive = ibv_wc_opcode::IBV_WC_RECV,
    ReceiveWithImmediate = ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM,
    Unknown = u32::MAX,
}

impl From<u32> for CompletionOpcode {
    fn from(opcode: u32) -> Self {
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => CompletionOpcode::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => CompletionOpcode::Write,
            ibv_wc_opcode::IBV_WC_RDMA_READ => CompletionOpcode::Read,
            ibv_wc_opcode::IBV_WC_BIND_MW => CompletionOpcode::BindMemoryWindow,
            ibv_wc_opcode::IBV_WC_RECV => CompletionOpcode::Receive,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => CompletionOpcode::ReceiveWithImmediate,
            _ => CompletionOpcode::Unknown,
        }
    }
}

#[bitmask(u64)]
#[bitmask_config(vec_debug)]
pub enum CreateCompletionQueueWorkCompletionFlags {
    ByteLength = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_BYTE_LEN.0 as _,
    ImmediateData = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_IMM.0 as _,
    QueuePairNumber = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_QP_NUM.0 as _,

    StandardFlags = CreateCompletionQueueWorkCompletionFlags::ByteLength.bits
        | CreateCompletionQueueWorkCompletionFlags::ImmediateData.bits
        | CreateCompletionQueueWorkCompletionFlags::QueuePairNumber.bits,
}

/// One polled work completion, read out of the CQ eagerly so it stays valid after the polling
/// round ends.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
    /// Immediate value carried by the peer's write, converted back to host byte order.
    pub immediate: Option<u32>,
    pub vendor_err: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// An extended completion queue, polled through the start / next / end poll protocol.
#[derive(Debug)]
pub struct CompletionQueue {
    pub(crate) cq_ex: NonNull<ibv_cq_ex>,
    _dev_ctx: Arc<DeviceContext>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq_ex.as_ptr().cast());
        }
    }
}

impl CompletionQueue {
    /// # Safety
    ///
    /// return the basic handle of CQ;
    /// we mark this method unsafe because the lifetime of ibv_cq is not
    /// associated with the return value.
    pub(crate) unsafe fn cq(&self) -> NonNull<ibv_cq> {
        self.cq_ex.cast()
    }

    /// Open one polling round. The returned iterator yields the completions currently in the
    /// queue and releases the CQ when dropped.
    pub fn start_poll(&self) -> Result<Poller<'_>, PollCompletionQueueError> {
        let ret = unsafe {
            ibv_start_poll(
                self.cq_ex.as_ptr(),
                MaybeUninit::<ibv_poll_cq_attr>::zeroed().as_mut_ptr(),
            )
        };

        match ret {
            0 => Ok(Poller {
                cq: self.cq_ex,
                is_first: true,
                _phantom: PhantomData,
            }),
            libc::ENOENT => Err(PollCompletionQueueError::CompletionQueueEmpty),
            err => Err(PollCompletionQueueError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }
}

pub struct CompletionQueueBuilder {
    dev_ctx: Arc<DeviceContext>,
    init_attr: ibv_cq_init_attr_ex,
}

impl CompletionQueueBuilder {
    pub fn new(dev_ctx: &Arc<DeviceContext>) -> Self {
        CompletionQueueBuilder {
            dev_ctx: Arc::clone(dev_ctx),
            init_attr: ibv_cq_init_attr_ex {
                cqe: 512,
                cq_context: ptr::null_mut::<c_void>(),
                channel: ptr::null_mut::<ibv_comp_channel>(),
                comp_vector: 0,
                wc_flags: CreateCompletionQueueWorkCompletionFlags::StandardFlags.bits,
                comp_mask: 0,
                flags: 0,
                parent_domain: ptr::null_mut::<ibv_pd>(),
            },
        }
    }

    pub fn setup_cqe(&mut self, cqe: u32) -> &mut Self {
        self.init_attr.cqe = cqe;
        self
    }

    pub fn setup_wc_flags(&mut self, wc_flags: CreateCompletionQueueWorkCompletionFlags) -> &mut Self {
        self.init_attr.wc_flags = wc_flags.bits;
        self
    }

    pub fn build(&self) -> Result<CompletionQueue, CreateCompletionQueueError> {
        // create a copy of init_attr since ibv_create_cq_ex requires a mutable pointer to it
        let mut init_attr = self.init_attr;

        let cq_ex = unsafe { ibv_create_cq_ex(self.dev_ctx.context, &mut init_attr as *mut _) };
        if cq_ex.is_null() {
            Err(CreateCompletionQueueErrorKind::Ibverbs(io::Error::last_os_error()).into())
        } else {
            Ok(CompletionQueue {
                cq_ex: unsafe { NonNull::new_unchecked(cq_ex) },
                _dev_ctx: Arc::clone(&self.dev_ctx),
            })
        }
    }
}

pub struct Poller<'cq> {
    cq: NonNull<ibv_cq_ex>,
    is_first: bool,
    _phantom: PhantomData<&'cq CompletionQueue>,
}

impl Drop for Poller<'_> {
    fn drop(&mut self) {
        unsafe { ibv_end_poll(self.cq.as_ptr()) }
    }
}

impl Poller<'_> {
    // For failed completions only wr_id and status are meaningful, the other
    // read verbs are not defined then.
    fn read_current(&self) -> WorkCompletion {
        let wr_id = unsafe { self.cq.as_ref().wr_id };
        let status = CompletionStatus::from(unsafe { self.cq.as_ref().status });

        if status != CompletionStatus::Success {
            return WorkCompletion {
                wr_id,
                status,
                opcode: CompletionOpcode::Unknown,
                byte_len: 0,
                immediate: None,
                vendor_err: unsafe { ibv_wc_read_vendor_err(self.cq.as_ptr()) },
            };
        }

        let immediate = if unsafe { ibv_wc_read_wc_flags(self.cq.as_ptr()) } & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0 {
            // The immediate travels in network byte order.
            Some(u32::from_be(unsafe { ibv_wc_read_imm_data(self.cq.as_ptr()) }))
        } else {
            None
        };

        WorkCompletion {
            wr_id,
            status,
            opcode: CompletionOpcode::from(unsafe { ibv_wc_read_opcode(self.cq.as_ptr()) }),
            byte_len: unsafe { ibv_wc_read_byte_len(self.cq.as_ptr()) },
            immediate,
            vendor_err: 0,
        }
    }
}

impl Iterator for Poller<'_> {
    type Item = WorkCompletion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_first {
            self.is_first = false;
            Some(self.read_current())
        } else {
            let ret = unsafe { ibv_next_poll(self.cq.as_ptr()) };

            if ret != 0 {
                None
            } else {
                Some(self.read_current())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ibv_wc_status::IBV_WC_SUCCESS, CompletionStatus::Success)]
    #[case(ibv_wc_status::IBV_WC_MW_BIND_ERR, CompletionStatus::MemoryWindowBindError)]
    #[case(ibv_wc_status::IBV_WC_REM_ACCESS_ERR, CompletionStatus::RemoteAccessError)]
    #[case(ibv_wc_status::IBV_WC_WR_FLUSH_ERR, CompletionStatus::WorkRequestFlushedError)]
    #[case(0xdead_beef, CompletionStatus::Unknown)]
    fn test_completion_status_conversion(#[case] raw: u32, #[case] expected: CompletionStatus) {
        assert_eq!(CompletionStatus::from(raw), expected);
    }

    #[rstest]
    #[case(ibv_wc_opcode::IBV_WC_BIND_MW, CompletionOpcode::BindMemoryWindow)]
    #[case(ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM, CompletionOpcode::ReceiveWithImmediate)]
    #[case(ibv_wc_opcode::IBV_WC_RDMA_WRITE, CompletionOpcode::Write)]
    #[case(0xdead_beef, CompletionOpcode::Unknown)]
    fn test_completion_opcode_conversion(#[case] raw: u32, #[case] expected: CompletionOpcode) {
        assert_eq!(CompletionOpcode::from(raw), expected);
    }

    #[test]
    fn test_round_trip_preserves_discriminants() {
        for variant in [
            CompletionStatus::Success,
            CompletionStatus::LocalProtectionError,
            CompletionStatus::RemoteInvalidRequestError,
            CompletionStatus::GeneralError,
        ] {
            assert_eq!(CompletionStatus::from(variant as u32), variant);
        }
    }
}
