use std::sync::Arc;
use std::time::Duration;

use windward::ibverbs::address::AddressHandleAttribute;
use windward::ibverbs::device;
use windward::ibverbs::device_context::{Mtu, PortState};
use windward::ibverbs::memory_region::PinnedBuffer;
use windward::ibverbs::memory_window::MemoryWindowKind;
use windward::ibverbs::queue_pair::{QueuePairAttribute, QueuePairState, QueuePairType};
use windward::ibverbs::AccessFlags;
use windward::poller::{CompletionPoller, WrId};

/// Loop a queue pair back onto itself, bind a window over a registered
/// buffer, then rebind and revoke it, confirming each key change through the
/// completion queue.
#[test]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let device_list = device::DeviceList::new()?;
    for device in &device_list {
        let ctx = device.open().unwrap();

        let port_attr = ctx.query_port(1).unwrap();
        if port_attr.port_state() != PortState::Active {
            println!("port 1 not active, skipping");
            continue;
        }
        let gid = ctx.query_gid(1, 0).unwrap();

        let pd = ctx.alloc_pd().unwrap();
        let cq = Arc::new(ctx.create_cq_builder().setup_cqe(64).build().unwrap());
        let mut qp = pd
            .create_qp_builder()
            .setup_qp_type(QueuePairType::UnreliableConnection)
            .setup_send_cq(&cq)
            .setup_recv_cq(&cq)
            .setup_max_send_wr(16)
            .setup_max_recv_wr(16)
            .build()
            .unwrap();
        assert_eq!(qp.state(), QueuePairState::Reset);

        let mut init_attr = QueuePairAttribute::new();
        init_attr
            .setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(1)
            .setup_access_flags(AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::MemoryWindowBind);
        qp.modify(&init_attr).unwrap();

        // loop the queue pair back onto itself
        let mut ah = AddressHandleAttribute::new();
        ah.setup_dest_lid(port_attr.lid()).setup_port(1);
        if port_attr.lid() == 0 {
            ah.setup_grh(&gid, 0, 0, 1, 0);
        }
        let mut rtr_attr = QueuePairAttribute::new();
        rtr_attr
            .setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(Mtu::Mtu1024)
            .setup_dest_qp_num(qp.qp_number())
            .setup_rq_psn(0)
            .setup_address_vector(&ah);
        qp.modify(&rtr_attr).unwrap();

        let mut rts_attr = QueuePairAttribute::new();
        rts_attr.setup_state(QueuePairState::ReadyToSend).setup_sq_psn(0);
        qp.modify(&rts_attr).unwrap();
        assert_eq!(qp.state(), QueuePairState::ReadyToSend);

        let buffer = PinnedBuffer::zeroed(4096).unwrap();
        let mr = unsafe {
            pd.reg_mr(
                buffer.addr() as usize,
                buffer.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::MemoryWindowBind,
            )
            .unwrap()
        };

        let mut mw = match pd.alloc_mw(MemoryWindowKind::Type1) {
            Ok(mw) => mw,
            Err(err) => {
                println!("type 1 windows not supported: {err}");
                continue;
            }
        };

        let timeout = Duration::from_secs(2);
        let poller = CompletionPoller::new(&cq);

        // first bind over the whole buffer
        mw.bind(
            &qp,
            &mr,
            buffer.addr(),
            buffer.len(),
            AccessFlags::RemoteWrite,
            WrId::Bind.encode(),
        )
        .unwrap();
        poller.wait_for(WrId::Bind, timeout).unwrap();
        let first = mw.complete_bind().unwrap();
        assert_eq!(mw.rkey(), Some(first));

        // a rebind replaces the key
        mw.bind(
            &qp,
            &mr,
            buffer.addr(),
            1024,
            AccessFlags::RemoteWrite,
            WrId::Bind.encode(),
        )
        .unwrap();
        poller.wait_for(WrId::Bind, timeout).unwrap();
        let second = mw.complete_bind().unwrap();
        assert_ne!(second, first);

        // a zero-length bind revokes access
        mw.bind(&qp, &mr, 0, 0, AccessFlags::RemoteWrite, WrId::Bind.encode())
            .unwrap();
        poller.wait_for(WrId::Bind, timeout).unwrap();
        assert_eq!(mw.complete_bind(), None);
        assert_eq!(mw.rkey(), None);

        println!("window lifecycle verified: {first} -> {second} -> revoked");
    }

    Ok(())
}
