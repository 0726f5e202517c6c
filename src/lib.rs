//! Windward sets up a one-sided remote-write data path between two peers over
//! InfiniBand / RoCE verbs. The responder registers a buffer, layers a
//! dynamically bindable (and revocable) memory window on top of it and
//! publishes the window's address and remote key through a TCP side channel;
//! the initiator then pushes payloads straight into the responder's memory
//! with RDMA write-with-immediate.

/// The wrapper over [libibverbs](https://github.com/linux-rdma/rdma-core/tree/master/libibverbs),
/// covering exactly the resources the data path needs: device, protection
/// domain, completion queue, queue pair, memory region and memory window.
pub mod ibverbs;

/// The fixed-size bootstrap record both peers swap out of band.
pub mod endpoint;

/// The TCP side channel used to swap bootstrap records and synchronize phases.
pub mod exchange;

/// Bounded, demultiplexed waiting on completion queues.
pub mod poller;

/// Session orchestration: transport bring-up, initiator and responder roles.
pub mod session;
