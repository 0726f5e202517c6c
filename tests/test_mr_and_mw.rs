use windward::ibverbs::device;
use windward::ibverbs::memory_region::PinnedBuffer;
use windward::ibverbs::memory_window::MemoryWindowKind;
use windward::ibverbs::AccessFlags;

#[test]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let device_list = device::DeviceList::new()?;
    for device in &device_list {
        let ctx = device.open().unwrap();

        let pd = ctx.alloc_pd().unwrap();
        let buffer = PinnedBuffer::zeroed(4096).unwrap();
        let mr = unsafe {
            pd.reg_mr(
                buffer.addr() as usize,
                buffer.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::MemoryWindowBind,
            )
            .unwrap()
        };
        println!("MR over {:#x}, lkey {}, rkey {}", mr.get_ptr(), mr.lkey(), mr.rkey());

        for kind in [MemoryWindowKind::Type1, MemoryWindowKind::Type2] {
            let mw = match pd.alloc_mw(kind) {
                Ok(mw) => mw,
                // some providers only support one window type
                Err(err) => {
                    println!("allocating {kind:?} window not supported: {err}");
                    continue;
                }
            };
            // a fresh window grants nothing until bound
            assert_eq!(mw.rkey(), None);
            assert!(!mw.bind_in_flight());
            println!("allocated {kind:?} window");
        }
    }

    Ok(())
}
