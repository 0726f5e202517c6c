//! The bootstrap record two peers swap over the out-of-band channel before any
//! RDMA traffic flows.
//!
//! The record is a flat, fixed-size byte layout in host order. Both sides of a
//! session run on the same architecture class in practice, and the fields are
//! opaque transport identifiers rather than numbers either side interprets, so
//! no endianness normalization is applied on the wire.

use std::fmt;

use crate::ibverbs::address::Gid;

/// Size in bytes of one serialized [`EndpointInfo`] record.
pub const WIRE_LEN: usize = 42;

/// Everything one peer needs to know about the other to bring a queue pair to
/// ready-to-send and, in the second exchange round, to address one-sided
/// writes at the responder's window.
///
/// `buf_addr` and `buf_rkey` are zero in the first round; the responder fills
/// them in for the second round once its memory window is bound.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub lid: u16,
    pub qp_number: u32,
    pub packet_seq: u32,
    pub queue_key: u32,
    pub gid: Gid,
    pub buf_addr: u64,
    pub buf_rkey: u32,
}

impl EndpointInfo {
    /// Serialize into the fixed wire layout.
    pub fn to_wire(&self) -> [u8; WIRE_LEN] {
        let mut buf = [0u8; WIRE_LEN];

        buf[0..2].copy_from_slice(&self.lid.to_ne_bytes());
        buf[2..6].copy_from_slice(&self.qp_number.to_ne_bytes());
        buf[6..10].copy_from_slice(&self.packet_seq.to_ne_bytes());
        buf[10..14].copy_from_slice(&self.queue_key.to_ne_bytes());
        buf[14..30].copy_from_slice(&self.gid.raw);
        buf[30..38].copy_from_slice(&self.buf_addr.to_ne_bytes());
        buf[38..42].copy_from_slice(&self.buf_rkey.to_ne_bytes());

        buf
    }

    /// Deserialize from the fixed wire layout.
    pub fn from_wire(buf: &[u8; WIRE_LEN]) -> Self {
        let mut gid = Gid::default();
        gid.raw.copy_from_slice(&buf[14..30]);

        EndpointInfo {
            lid: u16::from_ne_bytes(buf[0..2].try_into().unwrap()),
            qp_number: u32::from_ne_bytes(buf[2..6].try_into().unwrap()),
            packet_seq: u32::from_ne_bytes(buf[6..10].try_into().unwrap()),
            queue_key: u32::from_ne_bytes(buf[10..14].try_into().unwrap()),
            gid,
            buf_addr: u64::from_ne_bytes(buf[30..38].try_into().unwrap()),
            buf_rkey: u32::from_ne_bytes(buf[38..42].try_into().unwrap()),
        }
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "lid {:#06x}, qpn {:#010x}, psn {:#010x}, gid {}, buf {:#x} rkey {:#010x}",
            self.lid, self.qp_number, self.packet_seq, self.gid, self.buf_addr, self.buf_rkey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::str::FromStr;

    #[test]
    fn test_wire_round_trip() {
        let info = EndpointInfo {
            lid: 0xbeef,
            qp_number: 0x0012_3456,
            packet_seq: 0x00ab_cdef,
            queue_key: 0x1111_2222,
            gid: Ipv6Addr::from_str("fe80::dead:beef").unwrap().into(),
            buf_addr: 0x7fff_0000_1000,
            buf_rkey: 0x0042_4242,
        };

        let decoded = EndpointInfo::from_wire(&info.to_wire());
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_round_one_record_has_no_capability() {
        let info = EndpointInfo {
            lid: 1,
            qp_number: 77,
            packet_seq: 0x123,
            ..Default::default()
        };

        let wire = info.to_wire();
        // The capability fields trail the record and stay zero until round two.
        assert!(wire[30..].iter().all(|&b| b == 0));

        let decoded = EndpointInfo::from_wire(&wire);
        assert_eq!(decoded.buf_addr, 0);
        assert_eq!(decoded.buf_rkey, 0);
    }
}
