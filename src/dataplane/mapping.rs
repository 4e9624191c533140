//! Flow mappings
//!
//! A `Mapping` is one direction of a translated flow: the rewritten
//! 5-tuple, the output port, and checksum deltas precomputed so the
//! per-packet path is a single fold per checksum (RFC 1624).
//!
//! Mappings reference each other (pair partner, per-pattern list links),
//! so they live in a `MappingArena` and refer to each other by slot
//! index. The flow tables and pattern rover lists store these indices.

use super::flow::FlowId;
use crate::protocol::checksum::{apply_delta, fold16};
use crate::protocol::ipv4::Ipv4HeaderMut;
use crate::protocol::tcp::{self, TcpHeaderMut};
use crate::protocol::udp::UdpHeaderMut;
use std::ops::{Index, IndexMut};

/// Arena slot index of a live mapping
pub type MappingIdx = usize;

/// One direction of a translated flow
#[derive(Debug)]
pub struct Mapping {
    /// Rewritten 5-tuple stamped onto matching packets
    mapto: FlowId,
    /// Output port to emit on
    output: usize,
    /// Checksum increment covering the IP header words
    ip_csum_delta: u16,
    /// Checksum increment covering IP words plus transport ports
    transport_csum_delta: u16,
    /// Recency flag; set by `apply`, cleared by GC
    used: bool,
    /// True for the return-direction member of a pair
    is_reverse: bool,
    /// Paired mapping for the opposite direction
    reverse: MappingIdx,
    /// Owning pattern, if any (none for mapper-produced pairs)
    pattern: Option<usize>,
    // Circular list of the owning pattern's live forward mappings,
    // ordered by assigned source port.
    pat_prev: MappingIdx,
    pat_next: MappingIdx,
}

/// The six 16-bit words of a flow key: saddr, daddr, then the ports.
fn flow_words(flow: &FlowId) -> [u16; 6] {
    let s = flow.saddr().octets();
    let d = flow.daddr().octets();
    [
        u16::from_be_bytes([s[0], s[1]]),
        u16::from_be_bytes([s[2], s[3]]),
        u16::from_be_bytes([d[0], d[1]]),
        u16::from_be_bytes([d[2], d[3]]),
        flow.sport(),
        flow.dport(),
    ]
}

impl Mapping {
    fn new(
        inbound: &FlowId,
        outbound: &FlowId,
        pattern: Option<usize>,
        output: usize,
        is_reverse: bool,
    ) -> Self {
        // Checksum deltas: complement of each inbound word plus each
        // outbound word, folded after the address words (IP delta) and
        // again after the port words (transport delta).
        let inw = flow_words(inbound);
        let outw = flow_words(outbound);

        let mut sum: u32 = 0;
        for i in 0..4 {
            sum += (!inw[i] & 0xFFFF) as u32;
            sum += outw[i] as u32;
        }
        let ip_csum_delta = fold16(sum);

        sum = ip_csum_delta as u32;
        for i in 4..6 {
            sum += (!inw[i] & 0xFFFF) as u32;
            sum += outw[i] as u32;
        }
        let transport_csum_delta = fold16(sum);

        Self {
            mapto: *outbound,
            output,
            ip_csum_delta,
            transport_csum_delta,
            used: false,
            is_reverse,
            reverse: 0,
            pattern,
            pat_prev: 0,
            pat_next: 0,
        }
    }

    pub fn mapto(&self) -> &FlowId {
        &self.mapto
    }

    pub fn output(&self) -> usize {
        self.output
    }

    pub fn used(&self) -> bool {
        self.used
    }

    pub fn clear_used(&mut self) {
        self.used = false;
    }

    pub fn is_reverse(&self) -> bool {
        self.is_reverse
    }

    pub fn is_forward(&self) -> bool {
        !self.is_reverse
    }

    pub fn reverse(&self) -> MappingIdx {
        self.reverse
    }

    pub fn pattern(&self) -> Option<usize> {
        self.pattern
    }

    pub(crate) fn pat_prev(&self) -> MappingIdx {
        self.pat_prev
    }

    pub(crate) fn pat_next(&self) -> MappingIdx {
        self.pat_next
    }

    pub(crate) fn set_pat_prev(&mut self, idx: MappingIdx) {
        self.pat_prev = idx;
    }

    pub(crate) fn set_pat_next(&mut self, idx: MappingIdx) {
        self.pat_next = idx;
    }

    /// Rewrite a packet in place and mark the mapping used.
    ///
    /// Preconditions (established by the push path): exclusively owned
    /// buffer, validated IPv4 header, protocol TCP or UDP, transport
    /// header within bounds.
    pub fn apply(&mut self, packet: &mut [u8]) {
        let header_len = ((packet[0] & 0x0F) as usize) * 4;
        let protocol = packet[9];
        let (ip, transport) = packet.split_at_mut(header_len);

        let mut iph = Ipv4HeaderMut::new(ip);
        iph.set_src_addr(self.mapto.saddr());
        iph.set_dst_addr(self.mapto.daddr());
        let sum = apply_delta(iph.checksum(), self.ip_csum_delta);
        iph.set_checksum(sum);

        if protocol == tcp::PROTOCOL_NUMBER {
            let mut tcph = TcpHeaderMut::new(transport);
            tcph.set_src_port(self.mapto.sport());
            tcph.set_dst_port(self.mapto.dport());
            let sum = apply_delta(tcph.checksum(), self.transport_csum_delta);
            tcph.set_checksum(sum);
        } else {
            let mut udph = UdpHeaderMut::new(transport);
            udph.set_src_port(self.mapto.sport());
            udph.set_dst_port(self.mapto.dport());
            // 0 checksum is "no checksum"; leave it, and never create it.
            if udph.checksum() != 0 {
                let sum = match apply_delta(udph.checksum(), self.transport_csum_delta) {
                    0 => 0xFFFF,
                    c => c,
                };
                udph.set_checksum(sum);
            }
        }

        self.used = true;
    }
}

/// Slot arena holding every live mapping
///
/// Freed slots are recycled through a free list. Indices handed out stay
/// valid until the mapping is removed; the flow tables and pattern lists
/// uphold that invariant.
#[derive(Debug, Default)]
pub struct MappingArena {
    slots: Vec<Option<Mapping>>,
    free: Vec<MappingIdx>,
}

impl MappingArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, mapping: Mapping) -> MappingIdx {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(mapping);
                idx
            }
            None => {
                self.slots.push(Some(mapping));
                self.slots.len() - 1
            }
        }
    }

    /// Construct and cross-link a forward/reverse pair.
    ///
    /// The reverse member translates the return flow (the reversal of the
    /// outbound tuple) back to the reversal of the inbound tuple.
    pub fn insert_pair(
        &mut self,
        inbound: &FlowId,
        outbound: &FlowId,
        pattern: Option<usize>,
        foutput: usize,
        routput: usize,
    ) -> (MappingIdx, MappingIdx) {
        let forward = Mapping::new(inbound, outbound, pattern, foutput, false);
        let reverse = Mapping::new(&outbound.rev(), &inbound.rev(), pattern, routput, true);

        let fi = self.alloc(forward);
        let ri = self.alloc(reverse);
        self[fi].reverse = ri;
        self[ri].reverse = fi;
        (fi, ri)
    }

    pub fn remove(&mut self, idx: MappingIdx) -> Mapping {
        let mapping = self.slots[idx].take().expect("mapping slot already freed");
        self.free.push(idx);
        mapping
    }

    pub fn get(&self, idx: MappingIdx) -> Option<&Mapping> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// Number of live mappings (both directions counted)
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Index<MappingIdx> for MappingArena {
    type Output = Mapping;

    fn index(&self, idx: MappingIdx) -> &Mapping {
        self.slots[idx].as_ref().expect("stale mapping index")
    }
}

impl IndexMut<MappingIdx> for MappingArena {
    fn index_mut(&mut self, idx: MappingIdx) -> &mut Mapping {
        self.slots[idx].as_mut().expect("stale mapping index")
    }
}
