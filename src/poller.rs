//! Bounded, demultiplexed waiting on a completion queue.
//!
//! Every signaled work request carries a [`WrId`] encoding the completion
//! class the caller expects back. Waiting is always bounded by a deadline and
//! returns a discriminated result: the matched completion, a typed failure for
//! a non-success status, or a timeout. A completion that arrives out of order
//! for a different class is logged and skipped rather than treated as success.

use std::time::Duration;

use log::{trace, warn};
use quanta::Clock;

use crate::ibverbs::completion::{CompletionQueue, CompletionStatus, PollCompletionQueueError, WorkCompletion};

/// Typed work request identifier, mapping each signaled request to the
/// completion class expected for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrId {
    /// A posted receive, indexed by its slot in the receive ring.
    Receive(u16),
    /// A memory window bind on the send queue.
    Bind,
    /// A one-sided write (with immediate) on the send queue.
    Write,
}

const TAG_RECEIVE: u64 = 0x01;
const TAG_BIND: u64 = 0x02;
const TAG_WRITE: u64 = 0x03;

impl WrId {
    /// Encode into the opaque 64-bit identifier carried by the work request.
    /// The class tag lives in the top byte, the payload in the low bits.
    pub fn encode(self) -> u64 {
        match self {
            WrId::Receive(slot) => (TAG_RECEIVE << 56) | u64::from(slot),
            WrId::Bind => TAG_BIND << 56,
            WrId::Write => TAG_WRITE << 56,
        }
    }

    /// Decode an identifier read back from a completion. `None` for values
    /// this module never issued.
    pub fn decode(raw: u64) -> Option<Self> {
        match raw >> 56 {
            TAG_RECEIVE if raw & 0x00ff_ffff_ffff_0000 == 0 => Some(WrId::Receive(raw as u16)),
            TAG_BIND if raw & 0x00ff_ffff_ffff_ffff == 0 => Some(WrId::Bind),
            TAG_WRITE if raw & 0x00ff_ffff_ffff_ffff == 0 => Some(WrId::Write),
            _ => None,
        }
    }
}

/// Error returned by [`CompletionPoller::wait_for`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PollerError {
    #[error("no completion for {expected:?} within {timeout:?}")]
    TimedOut { expected: WrId, timeout: Duration },
    #[error("completion for wr_id {wr_id:#x} failed with status {status:?}")]
    CompletionFailed { wr_id: u64, status: CompletionStatus },
    #[error("failed to poll completion queue")]
    Transport(#[source] PollCompletionQueueError),
}

/// Busy-polls one completion queue with a deadline.
#[derive(Debug)]
pub struct CompletionPoller<'cq> {
    cq: &'cq CompletionQueue,
    clock: Clock,
}

impl<'cq> CompletionPoller<'cq> {
    pub fn new(cq: &'cq CompletionQueue) -> Self {
        CompletionPoller {
            cq,
            clock: Clock::new(),
        }
    }

    /// Spin until a completion tagged `expected` arrives, the deadline passes,
    /// or polling fails.
    ///
    /// Any completion with a non-success status ends the wait with
    /// [`PollerError::CompletionFailed`], whether or not its identifier
    /// matches; a failed completion means the queue pair is no longer
    /// trustworthy and the caller has to decide how to proceed. Successful
    /// completions for other classes are skipped with a warning — skipping
    /// consumes them off the queue, so a write that lands while the caller
    /// is waiting on a bind is dropped, not delivered to a later wait.
    /// Callers that care about every receive completion should drain them
    /// before issuing a wait for another class.
    pub fn wait_for(&self, expected: WrId, timeout: Duration) -> Result<WorkCompletion, PollerError> {
        let deadline = self.clock.now() + timeout;

        loop {
            let poller = match self.cq.start_poll() {
                Ok(poller) => poller,
                Err(PollCompletionQueueError::CompletionQueueEmpty) => {
                    if self.clock.now() >= deadline {
                        return Err(PollerError::TimedOut { expected, timeout });
                    }
                    std::hint::spin_loop();
                    continue;
                }
                Err(err) => return Err(PollerError::Transport(err)),
            };

            for wc in poller {
                if !wc.is_success() {
                    return Err(PollerError::CompletionFailed {
                        wr_id: wc.wr_id,
                        status: wc.status,
                    });
                }

                match WrId::decode(wc.wr_id) {
                    Some(id) if id == expected => {
                        trace!("completion matched {expected:?}: {wc:?}");
                        return Ok(wc);
                    }
                    Some(other) => {
                        warn!("skipping completion for {other:?} while waiting for {expected:?}");
                    }
                    None => {
                        warn!("skipping completion with unrecognized wr_id {:#x}", wc.wr_id);
                    }
                }
            }

            if self.clock.now() >= deadline {
                return Err(PollerError::TimedOut { expected, timeout });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(WrId::Receive(0))]
    #[case(WrId::Receive(1))]
    #[case(WrId::Receive(u16::MAX))]
    #[case(WrId::Bind)]
    #[case(WrId::Write)]
    fn test_wr_id_round_trip(#[case] id: WrId) {
        assert_eq!(WrId::decode(id.encode()), Some(id));
    }

    #[test]
    fn test_wr_id_classes_are_distinct() {
        assert_ne!(WrId::Receive(0).encode(), WrId::Bind.encode());
        assert_ne!(WrId::Bind.encode(), WrId::Write.encode());
        assert_ne!(WrId::Receive(0).encode(), WrId::Write.encode());
    }

    #[rstest]
    #[case(0)]
    #[case(0xff00_0000_0000_0000)]
    #[case((0x02 << 56) | 1)] // bind with stray payload bits
    #[case((0x01 << 56) | 0x1_0000)] // receive with bits above the slot index
    fn test_wr_id_rejects_foreign_values(#[case] raw: u64) {
        assert_eq!(WrId::decode(raw), None);
    }
}
