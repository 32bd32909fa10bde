//! Lower transport segmentation and reassembly.
//!
//! Upper transport PDUs that do not fit one network PDU are split into up to
//! 32 segments sharing one SeqZero. The receiving side collects segments per
//! `(src, seq_zero)` in a fixed 32-slot buffer and releases the message once
//! every offset `0..=seg_n` is present.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{SegmentError, WireError};
use crate::lower::{
    seq_auth, LowerTransportPdu, SegmentHeader, MAX_SEGMENTS, SEGMENT_ACCESS_SIZE,
    SEGMENT_CONTROL_SIZE, UNSEGMENTED_ACCESS_MAX, UNSEGMENTED_CONTROL_MAX,
};
use crate::message::{AssembledPdu, UpperTransportPdu};
use crate::network::NetworkPdu;

/// Default time an incomplete message is kept
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Splits upper transport PDUs into lower transport PDUs
#[derive(Debug, Clone, Copy, Default)]
pub struct Segmenter;

impl Segmenter {
    /// Create a new segmenter
    pub fn new() -> Self {
        Self
    }

    /// Split an upper transport PDU
    ///
    /// `seq_zero` is the low 13 bits of the sequence number assigned to the
    /// first PDU; every returned PDU needs its own sequence number. Access
    /// PDUs with a 64-bit TransMIC are always segmented.
    pub fn split(
        &self,
        pdu: &UpperTransportPdu,
        seq_zero: u16,
    ) -> Result<Vec<LowerTransportPdu>, WireError> {
        match pdu {
            UpperTransportPdu::Access {
                akf,
                aid,
                szmic,
                payload,
            } => {
                if !szmic && payload.len() <= UNSEGMENTED_ACCESS_MAX {
                    return Ok(vec![LowerTransportPdu::UnsegmentedAccess {
                        akf: *akf,
                        aid: *aid,
                        upper: payload.clone(),
                    }]);
                }
                let segments = chunk(payload, SEGMENT_ACCESS_SIZE)?;
                let seg_n = (segments.len() - 1) as u8;
                Ok(segments
                    .into_iter()
                    .enumerate()
                    .map(|(seg_o, segment)| LowerTransportPdu::SegmentedAccess {
                        akf: *akf,
                        aid: *aid,
                        header: SegmentHeader {
                            szmic: *szmic,
                            seq_zero,
                            seg_o: seg_o as u8,
                            seg_n,
                        },
                        segment,
                    })
                    .collect())
            }
            UpperTransportPdu::Control { opcode, params } => {
                if params.len() <= UNSEGMENTED_CONTROL_MAX {
                    return Ok(vec![LowerTransportPdu::UnsegmentedControl {
                        opcode: *opcode,
                        params: params.clone(),
                    }]);
                }
                let segments = chunk(params, SEGMENT_CONTROL_SIZE)?;
                let seg_n = (segments.len() - 1) as u8;
                Ok(segments
                    .into_iter()
                    .enumerate()
                    .map(|(seg_o, segment)| LowerTransportPdu::SegmentedControl {
                        opcode: *opcode,
                        header: SegmentHeader {
                            szmic: false,
                            seq_zero,
                            seg_o: seg_o as u8,
                            seg_n,
                        },
                        segment,
                    })
                    .collect())
            }
        }
    }
}

fn chunk(payload: &Bytes, size: usize) -> Result<Vec<Bytes>, WireError> {
    if payload.is_empty() {
        return Err(WireError::Size(0));
    }
    let count = (payload.len() + size - 1) / size;
    if count > MAX_SEGMENTS {
        return Err(SegmentError::TooMany(count).into());
    }
    Ok((0..count)
        .map(|i| payload.slice(i * size..std::cmp::min((i + 1) * size, payload.len())))
        .collect())
}

/// Identity of a message under reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    /// Source address
    pub src: u16,
    /// SeqZero shared by the segments
    pub seq_zero: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Access { akf: bool, aid: u8, szmic: bool },
    Control { opcode: u8 },
}

impl SegmentKind {
    fn segment_size(&self) -> usize {
        match self {
            SegmentKind::Access { .. } => SEGMENT_ACCESS_SIZE,
            SegmentKind::Control { .. } => SEGMENT_CONTROL_SIZE,
        }
    }
}

#[derive(Debug)]
struct PartialMessage {
    kind: SegmentKind,
    seg_n: u8,
    seq_auth: u32,
    dst: u16,
    ttl: u8,
    iv_index: u32,
    slots: [Option<Bytes>; MAX_SEGMENTS],
    last_fragment: Instant,
}

impl PartialMessage {
    fn new(kind: SegmentKind, seg_n: u8, seq_auth: u32, net: &NetworkPdu, now: Instant) -> Self {
        Self {
            kind,
            seg_n,
            seq_auth,
            dst: net.header.dst,
            ttl: net.header.ttl,
            iv_index: net.iv_index,
            slots: Default::default(),
            last_fragment: now,
        }
    }

    fn insert(
        &mut self,
        kind: SegmentKind,
        header: &SegmentHeader,
        segment: Bytes,
        ttl: u8,
        now: Instant,
    ) -> Result<(), WireError> {
        if kind != self.kind || header.seg_n != self.seg_n {
            return Err(SegmentError::Inconsistent.into());
        }
        if !header.is_last() && segment.len() != kind.segment_size() {
            return Err(WireError::Size(segment.len()));
        }

        let slot = &mut self.slots[header.seg_o as usize];
        match slot {
            Some(existing) if *existing != segment => {
                return Err(SegmentError::Conflict(header.seg_o).into());
            }
            Some(_) => {}
            None => {
                *slot = Some(segment);
                self.last_fragment = now;
            }
        }
        self.ttl = ttl;
        Ok(())
    }

    fn block_ack(&self) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u32, |acc, (i, _)| acc | (1 << i))
    }

    fn is_complete(&self) -> bool {
        self.slots[..=self.seg_n as usize].iter().all(Option::is_some)
    }

    fn assemble(self, src: u16) -> AssembledPdu {
        let mut buf = BytesMut::new();
        for segment in self.slots.iter().take(self.seg_n as usize + 1).flatten() {
            buf.extend_from_slice(segment);
        }
        let payload = buf.freeze();

        let pdu = match self.kind {
            SegmentKind::Access { akf, aid, szmic } => UpperTransportPdu::Access {
                akf,
                aid,
                szmic,
                payload,
            },
            SegmentKind::Control { opcode } => UpperTransportPdu::Control {
                opcode,
                params: payload,
            },
        };

        AssembledPdu {
            src,
            dst: self.dst,
            ttl: self.ttl,
            seq_auth: self.seq_auth,
            iv_index: self.iv_index,
            pdu,
        }
    }
}

/// Concurrent reassembler for segmented lower transport PDUs
#[derive(Debug)]
pub struct Reassembler {
    partials: DashMap<ReassemblyKey, PartialMessage>,
    timeout: Duration,
}

impl Reassembler {
    /// Create a reassembler that drops partial messages after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            partials: DashMap::new(),
            timeout,
        }
    }

    /// Number of messages currently being reassembled
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Accept one lower transport PDU
    ///
    /// Unsegmented PDUs complete immediately. Segments return `Ok(None)`
    /// until the last missing offset arrives.
    pub fn accept(
        &self,
        net: &NetworkPdu,
        lower: LowerTransportPdu,
        now: Instant,
    ) -> Result<Option<AssembledPdu>, WireError> {
        let src = net.header.src;
        let (kind, header, segment) = match lower {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper } => {
                return Ok(Some(unsegmented(
                    net,
                    UpperTransportPdu::Access {
                        akf,
                        aid,
                        szmic: false,
                        payload: upper,
                    },
                )));
            }
            LowerTransportPdu::UnsegmentedControl { opcode, params } => {
                return Ok(Some(unsegmented(
                    net,
                    UpperTransportPdu::Control { opcode, params },
                )));
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                header,
                segment,
            } => (
                SegmentKind::Access {
                    akf,
                    aid,
                    szmic: header.szmic,
                },
                header,
                segment,
            ),
            LowerTransportPdu::SegmentedControl {
                opcode,
                header,
                segment,
            } => (SegmentKind::Control { opcode }, header, segment),
        };

        let key = ReassemblyKey {
            src,
            seq_zero: header.seq_zero,
        };
        let auth = seq_auth(net.header.seq, header.seq_zero);
        let ttl = net.header.ttl;

        let complete = match self.partials.entry(key) {
            Entry::Occupied(mut occupied) => {
                let partial = occupied.get_mut();
                if auth < partial.seq_auth {
                    return Err(SegmentError::Stale.into());
                }
                if auth > partial.seq_auth {
                    let mut fresh = PartialMessage::new(kind, header.seg_n, auth, net, now);
                    fresh.insert(kind, &header, segment, ttl, now)?;
                    debug!(
                        "Replacing partial message from {:#06x} seq_zero={:#x}",
                        src, header.seq_zero
                    );
                    *partial = fresh;
                } else {
                    partial.insert(kind, &header, segment, ttl, now)?;
                }
                if partial.is_complete() {
                    Some(occupied.remove())
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                let mut partial = PartialMessage::new(kind, header.seg_n, auth, net, now);
                partial.insert(kind, &header, segment, ttl, now)?;
                if partial.is_complete() {
                    Some(partial)
                } else {
                    vacant.insert(partial);
                    None
                }
            }
        };

        Ok(complete.map(|partial| {
            debug!(
                "Reassembled {} segments from {:#06x} seq_auth={:#08x}",
                partial.seg_n as usize + 1,
                src,
                partial.seq_auth
            );
            partial.assemble(src)
        }))
    }

    /// Current block-ack bitmap for a message in progress
    pub fn block_ack(&self, key: &ReassemblyKey) -> Option<u32> {
        self.partials.get(key).map(|partial| partial.block_ack())
    }

    /// Drop messages that received no new segment within `timeout` before `now`
    pub fn expire(&self, now: Instant) -> Vec<ReassemblyKey> {
        let mut expired = Vec::new();
        self.partials.retain(|key, partial| {
            let keep = now.saturating_duration_since(partial.last_fragment) < self.timeout;
            if !keep {
                warn!(
                    "Reassembly timed out for {:#06x} seq_zero={:#x} ({} of {} segments)",
                    key.src,
                    key.seq_zero,
                    partial.block_ack().count_ones(),
                    partial.seg_n as u32 + 1
                );
                expired.push(*key);
            }
            keep
        });
        expired
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

fn unsegmented(net: &NetworkPdu, pdu: UpperTransportPdu) -> AssembledPdu {
    AssembledPdu {
        src: net.header.src,
        dst: net.header.dst,
        ttl: net.header.ttl,
        seq_auth: net.header.seq,
        iv_index: net.iv_index,
        pdu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::NetworkHeader;

    fn net(seq: u32) -> NetworkPdu {
        NetworkPdu::new(NetworkHeader::access(4, seq, 0x0003, 0x1201), 0x12345678, Bytes::new())
    }

    fn access(len: usize) -> UpperTransportPdu {
        UpperTransportPdu::Access {
            akf: false,
            aid: 0,
            szmic: false,
            payload: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>()),
        }
    }

    #[test]
    fn test_unsegmented_fits() {
        let pdus = Segmenter::new().split(&access(15), 0).unwrap();
        assert_eq!(pdus.len(), 1);
        assert!(pdus[0].segment_header().is_none());
    }

    #[test]
    fn test_segment_sizes() {
        let pdus = Segmenter::new().split(&access(24), 0x09ab).unwrap();
        assert_eq!(pdus.len(), 2);
        for (i, pdu) in pdus.iter().enumerate() {
            let header = pdu.segment_header().unwrap();
            assert_eq!(header.seq_zero, 0x09ab);
            assert_eq!(header.seg_o as usize, i);
            assert_eq!(header.seg_n, 1);
        }

        let control = UpperTransportPdu::Control {
            opcode: 0x0a,
            params: Bytes::from(vec![0u8; 17]),
        };
        assert_eq!(Segmenter::new().split(&control, 1).unwrap().len(), 3);
    }

    #[test]
    fn test_long_mic_forces_segmentation() {
        let pdu = UpperTransportPdu::Access {
            akf: true,
            aid: 1,
            szmic: true,
            payload: Bytes::from_static(&[0u8; 10]),
        };
        let pdus = Segmenter::new().split(&pdu, 7).unwrap();
        assert_eq!(pdus.len(), 1);
        assert!(pdus[0].segment_header().unwrap().szmic);
    }

    #[test]
    fn test_too_many_segments() {
        assert_eq!(
            Segmenter::new().split(&access(12 * 32 + 1), 0),
            Err(WireError::Segment(SegmentError::TooMany(33)))
        );
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let upper = access(40);
        let pdus = Segmenter::new().split(&upper, 0x0100).unwrap();
        assert_eq!(pdus.len(), 4);

        let reassembler = Reassembler::default();
        let now = Instant::now();
        let order = [3usize, 1, 0, 2];
        let mut result = None;
        for (n, &i) in order.iter().enumerate() {
            let seq = 0x0100 + i as u32;
            result = reassembler.accept(&net(seq), pdus[i].clone(), now).unwrap();
            if n < order.len() - 1 {
                assert!(result.is_none());
            }
        }

        let assembled = result.unwrap();
        assert_eq!(assembled.pdu, upper);
        assert_eq!(assembled.seq_auth, 0x0100);
        assert_eq!(assembled.src, 0x0003);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_block_ack_tracks_received() {
        let pdus = Segmenter::new().split(&access(40), 0x0010).unwrap();
        let reassembler = Reassembler::default();
        let now = Instant::now();
        reassembler.accept(&net(0x10), pdus[0].clone(), now).unwrap();
        reassembler.accept(&net(0x12), pdus[2].clone(), now).unwrap();

        let key = ReassemblyKey {
            src: 0x0003,
            seq_zero: 0x0010,
        };
        assert_eq!(reassembler.block_ack(&key), Some(0b101));
    }

    #[test]
    fn test_duplicate_segment_is_idempotent() {
        let pdus = Segmenter::new().split(&access(24), 0x0020).unwrap();
        let reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.accept(&net(0x20), pdus[0].clone(), now).unwrap().is_none());
        assert!(reassembler.accept(&net(0x20), pdus[0].clone(), now).unwrap().is_none());
        assert!(reassembler.accept(&net(0x21), pdus[1].clone(), now).unwrap().is_some());
    }

    #[test]
    fn test_conflicting_duplicate_rejected() {
        let pdus = Segmenter::new().split(&access(24), 0x0020).unwrap();
        let reassembler = Reassembler::default();
        let now = Instant::now();
        reassembler.accept(&net(0x20), pdus[0].clone(), now).unwrap();

        let forged = LowerTransportPdu::SegmentedAccess {
            akf: false,
            aid: 0,
            header: *pdus[0].segment_header().unwrap(),
            segment: Bytes::from_static(&[0xee; 12]),
        };
        assert_eq!(
            reassembler.accept(&net(0x20), forged, now),
            Err(WireError::Segment(SegmentError::Conflict(0)))
        );
    }

    #[test]
    fn test_inconsistent_seg_n_rejected() {
        let pdus = Segmenter::new().split(&access(24), 0x0030).unwrap();
        let reassembler = Reassembler::default();
        let now = Instant::now();
        reassembler.accept(&net(0x30), pdus[0].clone(), now).unwrap();

        let bad = LowerTransportPdu::SegmentedAccess {
            akf: false,
            aid: 0,
            header: SegmentHeader {
                szmic: false,
                seq_zero: 0x0030,
                seg_o: 2,
                seg_n: 2,
            },
            segment: Bytes::from_static(&[0u8; 4]),
        };
        assert_eq!(
            reassembler.accept(&net(0x31), bad, now),
            Err(WireError::Segment(SegmentError::Inconsistent))
        );
    }

    #[test]
    fn test_expire_drops_stale_partials() {
        let pdus = Segmenter::new().split(&access(24), 0x0040).unwrap();
        let reassembler = Reassembler::new(Duration::from_secs(5));
        let start = Instant::now();
        reassembler.accept(&net(0x40), pdus[0].clone(), start).unwrap();

        assert!(reassembler.expire(start + Duration::from_secs(1)).is_empty());
        let expired = reassembler.expire(start + Duration::from_secs(6));
        assert_eq!(
            expired,
            vec![ReassemblyKey {
                src: 0x0003,
                seq_zero: 0x0040
            }]
        );
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_new_segment_rearms_timeout() {
        let pdus = Segmenter::new().split(&access(30), 0x0010).unwrap();
        assert_eq!(pdus.len(), 3);
        let reassembler = Reassembler::new(Duration::from_secs(5));
        let start = Instant::now();
        reassembler.accept(&net(0x10), pdus[0].clone(), start).unwrap();
        reassembler
            .accept(&net(0x11), pdus[1].clone(), start + Duration::from_secs(4))
            .unwrap();

        assert!(reassembler.expire(start + Duration::from_secs(6)).is_empty());
        assert_eq!(reassembler.pending(), 1);

        // a repeated segment does not count as progress
        reassembler
            .accept(&net(0x11), pdus[1].clone(), start + Duration::from_secs(8))
            .unwrap();
        let expired = reassembler.expire(start + Duration::from_secs(10));
        assert_eq!(
            expired,
            vec![ReassemblyKey {
                src: 0x0003,
                seq_zero: 0x0010
            }]
        );
    }

    #[test]
    fn test_failed_replacement_keeps_partial() {
        let pdus = Segmenter::new().split(&access(24), 0x0050).unwrap();
        let reassembler = Reassembler::default();
        let now = Instant::now();
        reassembler.accept(&net(0x50), pdus[0].clone(), now).unwrap();

        // newer SeqAuth whose middle segment has the wrong length
        let bad = LowerTransportPdu::SegmentedAccess {
            akf: false,
            aid: 0,
            header: SegmentHeader {
                szmic: false,
                seq_zero: 0x0050,
                seg_o: 0,
                seg_n: 1,
            },
            segment: Bytes::from_static(&[0u8; 5]),
        };
        assert_eq!(
            reassembler.accept(&net(0x2050), bad, now),
            Err(WireError::Size(5))
        );

        let key = ReassemblyKey {
            src: 0x0003,
            seq_zero: 0x0050,
        };
        assert_eq!(reassembler.block_ack(&key), Some(0b1));
        let assembled = reassembler
            .accept(&net(0x51), pdus[1].clone(), now)
            .unwrap()
            .unwrap();
        assert_eq!(assembled.seq_auth, 0x50);
    }

    #[test]
    fn test_unsegmented_passes_through() {
        let reassembler = Reassembler::default();
        let lower = LowerTransportPdu::UnsegmentedControl {
            opcode: 0x0a,
            params: Bytes::from_static(&[1]),
        };
        let assembled = reassembler
            .accept(&net(0x55), lower, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(assembled.seq_auth, 0x55);
        assert_eq!(
            assembled.pdu,
            UpperTransportPdu::Control {
                opcode: 0x0a,
                params: Bytes::from_static(&[1])
            }
        );
    }
}
