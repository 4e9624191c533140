//! The rewriter element
//!
//! Top-level push path: classify a packet by 5-tuple, find or create its
//! mapping, rewrite in place, emit. One instance owns its flow tables,
//! patterns and mapping arena; packet processing and the GC tick run in
//! the same serial context, so nothing here locks.

use super::flow::FlowId;
use super::flow_table::FlowTable;
use super::mapping::{MappingArena, MappingIdx};
use super::pattern::{Pattern, PatternSpec};
use crate::protocol::ipv4::{Ipv4Header, Protocol};
use crate::protocol::tcp::TcpHeader;
use crate::protocol::udp::UdpHeader;
use crate::telemetry::RewriterMetrics;
use crate::{Error, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default GC interval; overridable per config.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(15);

/// What to do with a pushed packet. The packet is consumed either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    /// Emit the (possibly rewritten) packet on this output port.
    Emit(usize),
    /// Kill the packet.
    Drop,
}

/// External mapping source for an input port.
///
/// A mapper may return an existing mapping, install a new pair through
/// the provided state, or decline (the packet is dropped). Mappers that
/// allocate from their own patterns publish them for conflict analysis.
pub trait Mapper {
    fn get_map(&mut self, is_tcp: bool, flow: &FlowId, state: &mut RewriterState)
        -> Option<MappingIdx>;

    fn mapper_patterns(&self) -> Vec<PatternSpec> {
        Vec::new()
    }
}

/// Per-input rewrite policy
pub enum InputSpec {
    /// Kill every packet.
    Drop,
    /// Emit unmodified, no state created.
    NoChange { output: usize },
    /// Create mappings from a configured pattern.
    Pattern {
        pattern: usize,
        foutput: usize,
        routput: usize,
    },
    /// Delegate mapping creation to an external element.
    Mapper(Box<dyn Mapper>),
}

/// The mutable flow state: patterns, mapping arena, per-protocol tables.
///
/// Split out from the input-spec vector so a `Mapper` can be handed
/// mutable access to it during miss dispatch.
#[derive(Default)]
pub struct RewriterState {
    patterns: Vec<Pattern>,
    arena: MappingArena,
    tcp_map: FlowTable,
    udp_map: FlowTable,
}

impl RewriterState {
    pub fn add_pattern(&mut self, spec: PatternSpec) -> usize {
        self.patterns.push(Pattern::new(spec));
        self.patterns.len() - 1
    }

    pub fn pattern(&self, idx: usize) -> &Pattern {
        &self.patterns[idx]
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn arena(&self) -> &MappingArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut MappingArena {
        &mut self.arena
    }

    pub fn table(&self, is_tcp: bool) -> &FlowTable {
        if is_tcp {
            &self.tcp_map
        } else {
            &self.udp_map
        }
    }

    /// Install a pair into the protocol's table.
    pub fn install(&mut self, is_tcp: bool, forward: MappingIdx, reverse: MappingIdx) {
        let table = if is_tcp {
            &mut self.tcp_map
        } else {
            &mut self.udp_map
        };
        table.install(&self.arena, forward, reverse);
    }

    /// Create a pair from a configured pattern. `None` when its port pool
    /// is exhausted.
    pub fn create_pattern_mapping(
        &mut self,
        pattern_idx: usize,
        inbound: &FlowId,
        foutput: usize,
        routput: usize,
    ) -> Option<(MappingIdx, MappingIdx)> {
        let Self {
            patterns, arena, ..
        } = self;
        patterns[pattern_idx].create_mapping(arena, pattern_idx, inbound, foutput, routput)
    }

    fn gc(&mut self) -> usize {
        let Self {
            patterns,
            arena,
            tcp_map,
            udp_map,
        } = self;
        tcp_map.gc(arena, patterns) + udp_map.gc(arena, patterns)
    }

    fn clear(&mut self) {
        let Self {
            patterns,
            arena,
            tcp_map,
            udp_map,
        } = self;
        tcp_map.clear(arena, patterns);
        udp_map.clear(arena, patterns);
    }
}

enum MissAction {
    Mapping(MappingIdx),
    Emit(usize),
    Drop,
}

/// Connection-tracked NAPT element
pub struct Rewriter {
    input_specs: Vec<InputSpec>,
    noutputs: usize,
    state: RewriterState,
    gc_interval: Duration,
    metrics: Arc<RewriterMetrics>,
}

impl Rewriter {
    pub fn new(noutputs: usize, metrics: Arc<RewriterMetrics>) -> Self {
        Self {
            input_specs: Vec::new(),
            noutputs: noutputs.max(1),
            state: RewriterState::default(),
            gc_interval: DEFAULT_GC_INTERVAL,
            metrics,
        }
    }

    pub fn noutputs(&self) -> usize {
        self.noutputs
    }

    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }

    pub fn set_gc_interval(&mut self, interval: Duration) {
        self.gc_interval = interval;
    }

    pub fn metrics(&self) -> Arc<RewriterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> &RewriterState {
        &self.state
    }

    /// Register a pattern; input specs reference it by the returned index.
    /// Sharing one index across inputs shares one port pool.
    pub fn add_pattern(&mut self, spec: PatternSpec) -> usize {
        self.state.add_pattern(spec)
    }

    /// Append the policy for the next input port.
    pub fn add_input(&mut self, spec: InputSpec) -> Result<()> {
        let port = self.input_specs.len();
        match &spec {
            InputSpec::NoChange { output } => {
                if *output >= self.noutputs {
                    return Err(Error::Config(format!(
                        "input {}: output {} out of range (have {})",
                        port, output, self.noutputs
                    )));
                }
            }
            InputSpec::Pattern {
                pattern,
                foutput,
                routput,
            } => {
                if *pattern >= self.state.pattern_count() {
                    return Err(Error::Config(format!(
                        "input {}: unknown pattern index {}",
                        port, pattern
                    )));
                }
                if *foutput >= self.noutputs || *routput >= self.noutputs {
                    return Err(Error::Config(format!(
                        "input {}: output {}/{} out of range (have {})",
                        port, foutput, routput, self.noutputs
                    )));
                }
            }
            InputSpec::Drop | InputSpec::Mapper(_) => {}
        }
        self.input_specs.push(spec);
        Ok(())
    }

    pub fn ninputs(&self) -> usize {
        self.input_specs.len()
    }

    /// Live mapping pairs.
    pub fn active_pairs(&self) -> usize {
        self.state.arena().len() / 2
    }

    /// Process one packet arriving on `port`.
    ///
    /// The `&mut` borrow is the uniqueness guarantee the rewrite needs;
    /// the buffer is modified in place. Every call consumes the packet:
    /// it is either emitted on the returned output or dropped.
    pub fn push(&mut self, port: usize, packet: &mut [u8]) -> PushAction {
        let (is_tcp, flow) = match classify(packet) {
            Ok(x) => x,
            Err(e) => {
                debug!(port, error = %e, "dropping unclassifiable packet");
                self.metrics.malformed.inc();
                self.metrics.dropped.inc();
                return PushAction::Drop;
            }
        };

        let found = self.state.table(is_tcp).lookup(&flow);
        let mapping = match found {
            Some(idx) => idx,
            None => match self.dispatch_miss(port, is_tcp, &flow) {
                MissAction::Mapping(idx) => idx,
                MissAction::Emit(output) => {
                    self.metrics.passed_through.inc();
                    return PushAction::Emit(output);
                }
                MissAction::Drop => {
                    self.metrics.dropped.inc();
                    return PushAction::Drop;
                }
            },
        };

        let arena = self.state.arena_mut();
        arena[mapping].apply(packet);
        let output = arena[mapping].output();
        self.metrics.translated.inc();
        PushAction::Emit(output)
    }

    fn dispatch_miss(&mut self, port: usize, is_tcp: bool, flow: &FlowId) -> MissAction {
        let Self {
            input_specs,
            state,
            metrics,
            ..
        } = self;

        let Some(spec) = input_specs.get_mut(port) else {
            debug!(port, "no input spec for port");
            return MissAction::Drop;
        };

        match spec {
            InputSpec::Drop => MissAction::Drop,
            InputSpec::NoChange { output } => MissAction::Emit(*output),
            InputSpec::Pattern {
                pattern,
                foutput,
                routput,
            } => match state.create_pattern_mapping(*pattern, flow, *foutput, *routput) {
                Some((forward, reverse)) => {
                    state.install(is_tcp, forward, reverse);
                    metrics.mappings_created.inc();
                    debug!(port, %flow, mapto = %state.arena()[forward].mapto(), "mapping created");
                    MissAction::Mapping(forward)
                }
                None => {
                    debug!(port, %flow, "source port pool exhausted");
                    metrics.pool_exhausted.inc();
                    MissAction::Drop
                }
            },
            InputSpec::Mapper(mapper) => match mapper.get_map(is_tcp, flow, state) {
                Some(idx) => MissAction::Mapping(idx),
                None => MissAction::Drop,
            },
        }
    }

    /// Periodic GC tick: collect mapping pairs idle in both directions
    /// since the previous tick.
    pub fn tick(&mut self) {
        let reclaimed = self.state.gc();
        if reclaimed > 0 {
            debug!(reclaimed, "flow table GC");
            self.metrics.gc_reclaimed.add(reclaimed as u64);
        }
    }

    /// Element teardown: drop every mapping pair.
    pub fn clear(&mut self) {
        self.state.clear();
    }

    /// Read-only listing of the forward mappings, one line each:
    /// `inbound => outbound [output]`, grouped per protocol.
    pub fn dump_mappings(&self) -> String {
        let dump = |table: &FlowTable| {
            let mut s = String::new();
            for (flow, idx) in table.entries() {
                let m = &self.state.arena()[idx];
                if m.is_forward() {
                    let _ = writeln!(s, "{} => {} [{}]", flow, m.mapto(), m.output());
                }
            }
            s
        };

        let tcps = dump(self.state.table(true));
        let udps = dump(self.state.table(false));
        if !tcps.is_empty() && !udps.is_empty() {
            format!("TCP:\n{}\nUDP:\n{}", tcps, udps)
        } else if !tcps.is_empty() {
            format!("TCP:\n{}", tcps)
        } else if !udps.is_empty() {
            format!("UDP:\n{}", udps)
        } else {
            String::new()
        }
    }

    /// Read-only listing of the configured patterns, one line per
    /// pattern-kind input spec.
    pub fn dump_patterns(&self) -> String {
        let mut s = String::new();
        for spec in &self.input_specs {
            if let InputSpec::Pattern { pattern, .. } = spec {
                let _ = writeln!(s, "{}", self.state.pattern(*pattern).spec());
            }
        }
        s
    }
}

/// Classify a packet into its protocol and 5-tuple.
fn classify(packet: &[u8]) -> Result<(bool, FlowId)> {
    let iph = Ipv4Header::parse(packet)?;
    let protocol = Protocol::from_u8(iph.protocol())
        .ok_or_else(|| Error::InvalidPacket(format!("protocol {} not handled", iph.protocol())))?;

    let transport = iph.payload();
    let (sport, dport) = match protocol {
        Protocol::Tcp => {
            let tcph = TcpHeader::parse(transport)?;
            (tcph.src_port(), tcph.dst_port())
        }
        Protocol::Udp => {
            let udph = UdpHeader::parse(transport)?;
            (udph.src_port(), udph.dst_port())
        }
    };

    Ok((
        protocol == Protocol::Tcp,
        FlowId::new(iph.src_addr(), sport, iph.dst_addr(), dport),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipv4::Ipv4Builder;
    use crate::protocol::tcp::tcp_checksum;
    use std::net::Ipv4Addr;

    fn make_tcp_packet(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
        let mut seg = vec![
            0, 0, 0, 0, // ports (filled below)
            0, 0, 0, 1, // seq
            0, 0, 0, 0, // ack
            0x50, 0x02, // offset + SYN
            0x72, 0x10, // window
            0, 0, // checksum
            0, 0, // urgent
        ];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        let sum = tcp_checksum(src_ip, dst_ip, &seg);
        seg[16..18].copy_from_slice(&sum.to_be_bytes());

        Ipv4Builder::new()
            .src_addr(src_ip)
            .dst_addr(dst_ip)
            .protocol(Protocol::Tcp as u8)
            .payload(&seg)
            .build()
    }

    fn rewriter(noutputs: usize) -> Rewriter {
        Rewriter::new(noutputs, Arc::new(RewriterMetrics::new()))
    }

    #[test]
    fn test_push_drop_input() {
        let mut rw = rewriter(1);
        rw.add_input(InputSpec::Drop).unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        assert_eq!(rw.push(0, &mut packet), PushAction::Drop);
        assert_eq!(rw.metrics().dropped.get(), 1);
        assert_eq!(rw.active_pairs(), 0);
    }

    #[test]
    fn test_push_nochange_leaves_packet_alone() {
        let mut rw = rewriter(2);
        rw.add_input(InputSpec::NoChange { output: 1 }).unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        let before = packet.clone();
        assert_eq!(rw.push(0, &mut packet), PushAction::Emit(1));
        assert_eq!(packet, before);
        assert_eq!(rw.active_pairs(), 0);
    }

    #[test]
    fn test_push_pattern_translates_and_hits_on_second_packet() {
        let mut rw = rewriter(2);
        let pat = rw.add_pattern(
            PatternSpec::parse(&["1.2.3.4", "50000-50010", "-", "-"]).unwrap(),
        );
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();

        let lan = Ipv4Addr::new(192, 168, 1, 5);
        let server = Ipv4Addr::new(8, 8, 8, 8);

        let mut packet = make_tcp_packet(lan, server, 5000, 80);
        assert_eq!(rw.push(0, &mut packet), PushAction::Emit(0));

        let iph = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(iph.src_addr(), Ipv4Addr::new(1, 2, 3, 4));
        let tcph = TcpHeader::parse(iph.payload()).unwrap();
        assert_eq!(tcph.src_port(), 50000);

        // Second packet of the same flow takes the lookup path.
        let mut packet = make_tcp_packet(lan, server, 5000, 80);
        assert_eq!(rw.push(0, &mut packet), PushAction::Emit(0));
        assert_eq!(rw.metrics().mappings_created.get(), 1);
        assert_eq!(rw.metrics().translated.get(), 2);
        assert_eq!(rw.active_pairs(), 1);
    }

    #[test]
    fn test_push_reply_takes_reverse_mapping() {
        let mut rw = rewriter(2);
        let pat =
            rw.add_pattern(PatternSpec::parse(&["1.2.3.4", "50000-50010", "-", "-"]).unwrap());
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();
        rw.add_input(InputSpec::Drop).unwrap();

        let lan = Ipv4Addr::new(192, 168, 1, 5);
        let server = Ipv4Addr::new(8, 8, 8, 8);

        let mut packet = make_tcp_packet(lan, server, 5000, 80);
        rw.push(0, &mut packet);

        // Reply addressed to the translated source.
        let mut reply = make_tcp_packet(server, Ipv4Addr::new(1, 2, 3, 4), 80, 50000);
        assert_eq!(rw.push(1, &mut reply), PushAction::Emit(1));

        let iph = Ipv4Header::parse(&reply).unwrap();
        assert_eq!(iph.dst_addr(), lan);
        let tcph = TcpHeader::parse(iph.payload()).unwrap();
        assert_eq!(tcph.dst_port(), 5000);
    }

    #[test]
    fn test_push_pool_exhausted_drops() {
        let mut rw = rewriter(2);
        let pat =
            rw.add_pattern(PatternSpec::parse(&["1.2.3.4", "50000-50001", "-", "-"]).unwrap());
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();

        let lan = Ipv4Addr::new(192, 168, 1, 5);
        let server = Ipv4Addr::new(8, 8, 8, 8);
        for sport in [5000, 5001] {
            let mut p = make_tcp_packet(lan, server, sport, 80);
            assert_eq!(rw.push(0, &mut p), PushAction::Emit(0));
        }

        let mut p = make_tcp_packet(lan, server, 5002, 80);
        assert_eq!(rw.push(0, &mut p), PushAction::Drop);
        assert_eq!(rw.metrics().pool_exhausted.get(), 1);
        assert_eq!(rw.metrics().dropped.get(), 1);
    }

    #[test]
    fn test_push_unknown_port_drops() {
        let mut rw = rewriter(1);
        rw.add_input(InputSpec::Drop).unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        assert_eq!(rw.push(7, &mut packet), PushAction::Drop);
    }

    #[test]
    fn test_push_malformed_drops() {
        let mut rw = rewriter(1);
        rw.add_input(InputSpec::NoChange { output: 0 }).unwrap();

        let mut junk = vec![0u8; 10];
        assert_eq!(rw.push(0, &mut junk), PushAction::Drop);
        assert_eq!(rw.metrics().malformed.get(), 1);
    }

    #[test]
    fn test_mapper_input_spec() {
        struct FixedMapper;

        impl Mapper for FixedMapper {
            fn get_map(
                &mut self,
                is_tcp: bool,
                flow: &FlowId,
                state: &mut RewriterState,
            ) -> Option<MappingIdx> {
                let outbound = FlowId::new(
                    Ipv4Addr::new(9, 9, 9, 9),
                    40000,
                    flow.daddr(),
                    flow.dport(),
                );
                let (forward, reverse) =
                    state
                        .arena_mut()
                        .insert_pair(flow, &outbound, None, 0, 1);
                state.install(is_tcp, forward, reverse);
                Some(forward)
            }
        }

        let mut rw = rewriter(2);
        rw.add_input(InputSpec::Mapper(Box::new(FixedMapper))).unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        assert_eq!(rw.push(0, &mut packet), PushAction::Emit(0));

        let iph = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(iph.src_addr(), Ipv4Addr::new(9, 9, 9, 9));
        assert_eq!(rw.active_pairs(), 1);
    }

    #[test]
    fn test_tick_collects_idle_pairs() {
        let mut rw = rewriter(2);
        let pat =
            rw.add_pattern(PatternSpec::parse(&["1.2.3.4", "50000-50010", "-", "-"]).unwrap());
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        rw.push(0, &mut packet);
        assert_eq!(rw.active_pairs(), 1);

        rw.tick(); // clears used
        assert_eq!(rw.active_pairs(), 1);
        rw.tick(); // collects
        assert_eq!(rw.active_pairs(), 0);
        assert_eq!(rw.metrics().gc_reclaimed.get(), 1);
    }

    #[test]
    fn test_add_input_validates_outputs() {
        let mut rw = rewriter(2);
        assert!(rw.add_input(InputSpec::NoChange { output: 2 }).is_err());
        assert!(rw
            .add_input(InputSpec::Pattern {
                pattern: 0,
                foutput: 0,
                routput: 1
            })
            .is_err()); // no such pattern

        let pat = rw.add_pattern(PatternSpec::parse(&["-", "-", "-", "-"]).unwrap());
        assert!(rw
            .add_input(InputSpec::Pattern {
                pattern: pat,
                foutput: 0,
                routput: 5
            })
            .is_err());
    }

    #[test]
    fn test_dumps() {
        let mut rw = rewriter(2);
        let pat =
            rw.add_pattern(PatternSpec::parse(&["1.2.3.4", "50000-50010", "-", "-"]).unwrap());
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();

        assert_eq!(rw.dump_patterns(), "1.2.3.4:50000-50010 / -:-\n");
        assert_eq!(rw.dump_mappings(), "");

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        rw.push(0, &mut packet);

        let dump = rw.dump_mappings();
        assert!(dump.starts_with("TCP:\n"));
        assert!(dump
            .contains("192.168.1.5:5000 -> 8.8.8.8:80 => 1.2.3.4:50000 -> 8.8.8.8:80 [0]"));
    }

    #[test]
    fn test_clear_tears_down_state() {
        let mut rw = rewriter(2);
        let pat =
            rw.add_pattern(PatternSpec::parse(&["1.2.3.4", "50000-50010", "-", "-"]).unwrap());
        rw.add_input(InputSpec::Pattern {
            pattern: pat,
            foutput: 0,
            routput: 1,
        })
        .unwrap();

        let mut packet = make_tcp_packet(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            80,
        );
        rw.push(0, &mut packet);
        rw.clear();
        assert_eq!(rw.active_pairs(), 0);
        assert_eq!(rw.dump_mappings(), "");
    }
}
