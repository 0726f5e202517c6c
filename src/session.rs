//! Session orchestration for the one-sided write data path.
//!
//! A session has exactly two roles. The [`Responder`] owns the exposed buffer:
//! it registers memory, layers a revocable window over it, publishes the
//! window's address and key over the bootstrap channel and then waits for
//! incoming writes. The [`Initiator`] consumes the published capability and
//! pushes payloads with write-with-immediate. Bring-up is a strict linear
//! sequence on both sides; any failure unwinds every resource already
//! acquired, most recently acquired first, and surfaces a typed error.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::endpoint::EndpointInfo;
use crate::exchange::{ExchangeChannel, ExchangeError, DEFAULT_PORT};
use crate::ibverbs::{
    address::AddressHandleAttribute,
    completion::{CompletionQueue, CreateCompletionQueueError, WorkCompletion},
    device::{DeviceList, GetDeviceListError, OpenDeviceError},
    device_context::{
        AllocateProtectionDomainError, DeviceContext, LinkLayer, Mtu, QueryGidError, QueryPortError,
    },
    memory_region::{AllocateBufferError, MemoryRegion, PinnedBuffer, RegisterMemoryRegionError},
    memory_window::{AllocateMemoryWindowError, BindMemoryWindowError, MemoryWindow, MemoryWindowKind},
    protection_domain::ProtectionDomain,
    queue_pair::{
        CreateQueuePairError, ModifyQueuePairError, PostRecvError, PostSendError, QueuePair, QueuePairAttribute,
        QueuePairState, QueuePairType, WorkRequestFlags,
    },
    AccessFlags,
};
use crate::poller::{CompletionPoller, PollerError, WrId};

const CQ_CAPACITY: u32 = 512;
const QUEUE_DEPTH: u32 = 512;
const MAX_SGE: u32 = 2;
const PHYS_PORT: u8 = 1;
const PKEY_INDEX: u16 = 0;
const HOP_LIMIT: u8 = 1;
const RECV_SLOTS: u16 = 2;

/// Error returned by session bring-up and data-path operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no RDMA device found")]
    NoDevice,
    #[error(transparent)]
    DeviceList(#[from] GetDeviceListError),
    #[error(transparent)]
    OpenDevice(#[from] OpenDeviceError),
    #[error(transparent)]
    QueryPort(#[from] QueryPortError),
    #[error(transparent)]
    QueryGid(#[from] QueryGidError),
    #[error(transparent)]
    AllocateProtectionDomain(#[from] AllocateProtectionDomainError),
    #[error(transparent)]
    CreateCompletionQueue(#[from] CreateCompletionQueueError),
    #[error(transparent)]
    CreateQueuePair(#[from] CreateQueuePairError),
    #[error(transparent)]
    ModifyQueuePair(#[from] ModifyQueuePairError),
    #[error(transparent)]
    AllocateBuffer(#[from] AllocateBufferError),
    #[error(transparent)]
    RegisterMemoryRegion(#[from] RegisterMemoryRegionError),
    #[error(transparent)]
    AllocateMemoryWindow(#[from] AllocateMemoryWindowError),
    #[error(transparent)]
    BindMemoryWindow(#[from] BindMemoryWindowError),
    #[error(transparent)]
    PostSend(#[from] PostSendError),
    #[error(transparent)]
    PostRecv(#[from] PostRecvError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Poll(#[from] PollerError),
    #[error("payload of {len} bytes exceeds buffer capacity of {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("responder did not publish a write capability")]
    NoRemoteCapability,
}

/// Knobs shared by both roles. Both peers must agree on `port` and should
/// agree on `mtu`; everything else is local.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port of the bootstrap channel.
    pub port: u16,
    /// Size in bytes of the data buffer (responder: the exposed buffer,
    /// initiator: the staging buffer).
    pub buffer_len: usize,
    /// Path MTU programmed into the queue pair.
    pub mtu: Mtu,
    /// GID table index; an index above zero forces the global route header
    /// even on InfiniBand link layers.
    pub gid_index: u32,
    /// Kind of window the responder binds over its buffer.
    pub window_kind: MemoryWindowKind,
    /// Deadline for any single completion wait.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port: DEFAULT_PORT,
            buffer_len: 4096,
            mtu: Mtu::Mtu4096,
            gid_index: 0,
            window_kind: MemoryWindowKind::Type1,
            timeout: Duration::from_secs(5),
        }
    }
}

/// A write that landed in the responder's buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedWrite {
    /// Immediate value the initiator attached, in host order.
    pub immediate: Option<u32>,
    /// Number of payload bytes written.
    pub byte_len: u32,
}

/// The RDMA resources of one side, acquired in order and dropped in exact
/// reverse order (fields drop top to bottom: queue pair, completion queue,
/// protection domain, device context).
pub(crate) struct Transport {
    qp: QueuePair,
    cq: Arc<CompletionQueue>,
    pd: Arc<ProtectionDomain>,
    _ctx: Arc<DeviceContext>,
    link_layer: LinkLayer,
    local: EndpointInfo,
}

impl Transport {
    /// Open the first enumerated device and bring a queue pair to Init with
    /// `access` rights. Populates the local bootstrap record.
    fn bring_up(config: &SessionConfig, access: AccessFlags) -> Result<Self, SessionError> {
        let devices = DeviceList::new()?;
        let device = devices.get(0).ok_or(SessionError::NoDevice)?;
        let ctx = device.open()?;

        let port_attr = ctx.query_port(PHYS_PORT)?;
        let gid = ctx.query_gid(PHYS_PORT, config.gid_index)?;

        let pd = ctx.alloc_pd()?;
        let cq = Arc::new(ctx.create_cq_builder().setup_cqe(CQ_CAPACITY).build()?);

        let mut qp = pd
            .create_qp_builder()
            .setup_qp_type(QueuePairType::UnreliableConnection)
            .setup_send_cq(&cq)
            .setup_recv_cq(&cq)
            .setup_max_send_wr(QUEUE_DEPTH)
            .setup_max_recv_wr(QUEUE_DEPTH)
            .setup_max_send_sge(MAX_SGE)
            .setup_max_recv_sge(MAX_SGE)
            .build()?;

        let mut init_attr = QueuePairAttribute::new();
        init_attr
            .setup_state(QueuePairState::Init)
            .setup_pkey_index(PKEY_INDEX)
            .setup_port(PHYS_PORT)
            .setup_access_flags(access);
        qp.modify(&init_attr)?;

        let local = EndpointInfo {
            lid: port_attr.lid(),
            qp_number: qp.qp_number(),
            packet_seq: rand::random::<u32>() & 0x00ff_ffff,
            queue_key: 0,
            gid,
            buf_addr: 0,
            buf_rkey: 0,
        };
        debug!("local endpoint: {local}");

        Ok(Transport {
            qp,
            cq,
            pd,
            _ctx: ctx,
            link_layer: port_attr.link_layer(),
            local,
        })
    }

    /// Drive the queue pair from Init through ready-to-receive to
    /// ready-to-send against `remote`.
    fn connect_peer(&mut self, remote: &EndpointInfo, config: &SessionConfig) -> Result<(), SessionError> {
        let mut ah = AddressHandleAttribute::new();
        ah.setup_dest_lid(remote.lid)
            .setup_service_level(0)
            .setup_port(PHYS_PORT);
        // RoCE has no LID routing, the global route header is mandatory there.
        if self.link_layer == LinkLayer::Ethernet || config.gid_index > 0 {
            ah.setup_grh(&remote.gid, 0, config.gid_index as u8, HOP_LIMIT, 0);
        }

        let mut rtr_attr = QueuePairAttribute::new();
        rtr_attr
            .setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(config.mtu)
            .setup_dest_qp_num(remote.qp_number)
            .setup_rq_psn(remote.packet_seq)
            .setup_address_vector(&ah);
        self.qp.modify(&rtr_attr)?;
        debug!("queue pair {} reached ready-to-receive", self.local.qp_number);

        let mut rts_attr = QueuePairAttribute::new();
        rts_attr
            .setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(self.local.packet_seq);
        self.qp.modify(&rts_attr)?;
        debug!("queue pair {} reached ready-to-send", self.local.qp_number);

        Ok(())
    }

    fn wait_for(&self, expected: WrId, timeout: Duration) -> Result<WorkCompletion, PollerError> {
        CompletionPoller::new(&self.cq).wait_for(expected, timeout)
    }
}

/// The side that exposes memory. Owns the published buffer, its registration
/// and the window granting the peer write access.
pub struct Responder {
    window: MemoryWindow,
    recv_region: MemoryRegion,
    recv_buf: PinnedBuffer,
    region: MemoryRegion,
    buffer: PinnedBuffer,
    transport: Transport,
    config: SessionConfig,
    next_slot: u16,
}

impl Responder {
    /// Bring up the transport, accept one initiator on the bootstrap port,
    /// connect the queue pairs, bind the window over the whole buffer and
    /// publish its capability. Returns once both sides passed the readiness
    /// barrier, ready for [`Responder::recv`].
    pub fn accept(config: SessionConfig) -> Result<Self, SessionError> {
        let mut transport = Transport::bring_up(
            &config,
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::MemoryWindowBind,
        )?;

        let mut channel = ExchangeChannel::accept(config.port)?;
        let remote = channel.exchange(&transport.local)?;
        info!("initiator endpoint: {remote}");

        transport.connect_peer(&remote, &config)?;

        let buffer = PinnedBuffer::zeroed(config.buffer_len)?;
        // The window is carved out of this region, so it needs bind rights on
        // top of local write.
        let region = unsafe {
            transport.pd.reg_mr(
                buffer.addr() as usize,
                buffer.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::MemoryWindowBind,
            )?
        };

        let slot_len = config.mtu.payload_size() as usize;
        let recv_buf = PinnedBuffer::zeroed(slot_len * usize::from(RECV_SLOTS))?;
        let recv_region = unsafe {
            transport
                .pd
                .reg_mr(recv_buf.addr() as usize, recv_buf.len(), AccessFlags::LocalWrite)?
        };

        let window = transport.pd.alloc_mw(config.window_kind)?;

        let mut responder = Responder {
            window,
            recv_region,
            recv_buf,
            region,
            buffer,
            transport,
            config,
            next_slot: 0,
        };

        for slot in 0..RECV_SLOTS {
            responder.post_recv(slot)?;
        }

        let rkey = responder
            .bind_window(responder.buffer.len())?
            .ok_or(SessionError::NoRemoteCapability)?;

        let mut published = responder.transport.local;
        published.buf_addr = responder.buffer.addr();
        published.buf_rkey = rkey;
        channel.exchange(&published)?;
        info!("published window: addr {:#x}, rkey {rkey:#010x}", published.buf_addr);

        channel.ready()?;
        Ok(responder)
    }

    /// Block until the next write-with-immediate lands, bounded by the
    /// configured timeout. Reposts the consumed receive slot before returning.
    pub fn recv(&mut self) -> Result<ReceivedWrite, SessionError> {
        let slot = self.next_slot;
        let wc = self.transport.wait_for(WrId::Receive(slot), self.config.timeout)?;

        self.post_recv(slot)?;
        self.next_slot = (slot + 1) % RECV_SLOTS;

        Ok(ReceivedWrite {
            immediate: wc.immediate,
            byte_len: wc.byte_len,
        })
    }

    /// The exposed buffer the peer writes into.
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The remote key currently granting access, `None` after a revoke.
    pub fn rkey(&self) -> Option<u32> {
        self.window.rkey()
    }

    /// Rebind the window over the first `len` bytes of the buffer, replacing
    /// the current remote key with a fresh one. Returns the new key.
    pub fn rebind(&mut self, len: usize) -> Result<Option<u32>, SessionError> {
        if len > self.buffer.len() {
            return Err(SessionError::PayloadTooLarge {
                len,
                capacity: self.buffer.len(),
            });
        }
        self.bind_window(len)
    }

    /// Revoke remote access entirely. Writes against the old key fail at the
    /// initiator from this point on; the window can be rebound later.
    pub fn revoke(&mut self) -> Result<(), SessionError> {
        self.bind_window(0)?;
        info!("window revoked, previous remote key is dead");
        Ok(())
    }

    fn bind_window(&mut self, len: usize) -> Result<Option<u32>, SessionError> {
        let addr = self.buffer.addr();
        match self.window.kind() {
            MemoryWindowKind::Type1 => {
                self.window.bind(
                    &self.transport.qp,
                    &self.region,
                    addr,
                    len,
                    AccessFlags::RemoteWrite,
                    WrId::Bind.encode(),
                )?;
            }
            MemoryWindowKind::Type2 => {
                let mut guard = self.transport.qp.start_post_send();
                let result = guard.construct_wr(WrId::Bind.encode(), WorkRequestFlags::Signaled).setup_bind(
                    &mut self.window,
                    &self.region,
                    addr,
                    len,
                    AccessFlags::RemoteWrite,
                );
                match result {
                    Ok(_) => guard.post()?,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        match self.transport.wait_for(WrId::Bind, self.config.timeout) {
            Ok(_) => Ok(self.window.complete_bind()),
            Err(err) => {
                self.window.abort_bind();
                Err(err.into())
            }
        }
    }

    fn post_recv(&mut self, slot: u16) -> Result<(), SessionError> {
        let slot_len = self.config.mtu.payload_size() as u32;
        let addr = self.recv_buf.addr() + u64::from(slot) * u64::from(slot_len);

        let mut guard = self.transport.qp.start_post_recv();
        unsafe {
            guard
                .construct_wr(WrId::Receive(slot).encode())
                .setup_sge(self.recv_region.lkey(), addr, slot_len);
        }
        guard.post()?;
        Ok(())
    }
}

/// The side that writes. Stages payloads in a local buffer and pushes them
/// into the responder's published window.
pub struct Initiator {
    region: MemoryRegion,
    buffer: PinnedBuffer,
    transport: Transport,
    remote: EndpointInfo,
    config: SessionConfig,
}

impl Initiator {
    /// Connect to a responder at `addr`, run both exchange rounds and the
    /// readiness barrier. Returns once the responder's capability is in hand.
    pub fn connect(addr: &str, config: SessionConfig) -> Result<Self, SessionError> {
        let mut transport = Transport::bring_up(&config, AccessFlags::LocalWrite)?;

        let mut channel = ExchangeChannel::connect(addr)?;
        let remote = channel.exchange(&transport.local)?;
        info!("responder endpoint: {remote}");

        transport.connect_peer(&remote, &config)?;

        // Round two carries the same transport identity plus the capability.
        let remote = channel.exchange(&transport.local)?;
        if remote.buf_addr == 0 || remote.buf_rkey == 0 {
            return Err(SessionError::NoRemoteCapability);
        }
        info!("write capability: addr {:#x}, rkey {:#010x}", remote.buf_addr, remote.buf_rkey);

        channel.ready()?;

        let buffer = PinnedBuffer::zeroed(config.buffer_len)?;
        let region = unsafe {
            transport
                .pd
                .reg_mr(buffer.addr() as usize, buffer.len(), AccessFlags::LocalWrite)?
        };

        Ok(Initiator {
            region,
            buffer,
            transport,
            remote,
            config,
        })
    }

    /// Write `payload` into the start of the responder's window, attaching
    /// `immediate` (host order), and wait for the send-side completion.
    pub fn write(&mut self, payload: &[u8], immediate: u32) -> Result<(), SessionError> {
        if payload.len() > self.buffer.len() {
            return Err(SessionError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.buffer.len(),
            });
        }
        let len = self.buffer.fill_from(payload);

        let mut guard = self.transport.qp.start_post_send();
        unsafe {
            guard
                .construct_wr(WrId::Write.encode(), WorkRequestFlags::Signaled)
                .setup_write_imm(self.remote.buf_rkey, self.remote.buf_addr, immediate)
                .setup_sge(self.region.lkey(), self.buffer.addr(), len as u32);
        }
        guard.post()?;

        self.transport.wait_for(WrId::Write, self.config.timeout)?;
        debug!("wrote {len} bytes with immediate {immediate}");
        Ok(())
    }
}
