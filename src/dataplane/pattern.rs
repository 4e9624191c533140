//! Rewrite patterns
//!
//! A pattern is the template half of an input policy: where translated
//! traffic should appear to come from and go to. Wildcard fields take
//! their value from the packet that triggers the mapping. A pattern with
//! a source-port range owns a port pool; allocation walks a circular list
//! of the pattern's live forward mappings behind a rover cursor, so
//! successive allocations are amortized O(1).

use super::flow::FlowId;
use super::mapping::{MappingArena, MappingIdx};
use crate::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Rewrite template: `SADDR SPORT DADDR DPORT`, any field wildcardable
///
/// `None` is the wildcard (`-` in the textual form): the corresponding
/// field of the inbound flow is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    pub saddr: Option<Ipv4Addr>,
    pub sport: Option<PortRange>,
    pub daddr: Option<Ipv4Addr>,
    pub dport: Option<u16>,
}

fn parse_addr(word: &str, which: &str) -> Result<Option<Ipv4Addr>> {
    if word == "-" {
        return Ok(None);
    }
    word.parse()
        .map(Some)
        .map_err(|_| Error::Config(format!("bad {} `{}' in pattern spec", which, word)))
}

fn parse_sport(word: &str) -> Result<Option<PortRange>> {
    if word == "-" {
        return Ok(None);
    }
    let range = if let Some((lo, hi)) = word.split_once('-') {
        let lo: u16 = lo
            .parse()
            .map_err(|_| Error::Config(format!("bad source port `{}' in pattern spec", word)))?;
        let hi: u16 = hi
            .parse()
            .map_err(|_| Error::Config(format!("bad source port `{}' in pattern spec", word)))?;
        if lo > hi {
            return Err(Error::Config(format!(
                "source ports {}-{} out of range in pattern spec",
                lo, hi
            )));
        }
        PortRange::new(lo, hi)
    } else {
        let port: u16 = word
            .parse()
            .map_err(|_| Error::Config(format!("bad source port `{}' in pattern spec", word)))?;
        PortRange::single(port)
    };
    Ok(Some(range))
}

impl PatternSpec {
    /// Parse the four-token form `SADDR SPORT DADDR DPORT`.
    ///
    /// Named-pattern references are resolved by the config layer before
    /// reaching this parser.
    pub fn parse(words: &[&str]) -> Result<Self> {
        if words.len() != 4 {
            return Err(Error::Config(
                "bad pattern spec: should be `SADDR SPORT DADDR DPORT'".into(),
            ));
        }

        let saddr = parse_addr(words[0], "source address")?;
        let sport = parse_sport(words[1])?;
        let daddr = parse_addr(words[2], "destination address")?;
        let dport = if words[3] == "-" {
            None
        } else {
            Some(words[3].parse().map_err(|_| {
                Error::Config(format!(
                    "bad destination port `{}' in pattern spec",
                    words[3]
                ))
            })?)
        };

        Ok(Self {
            saddr,
            sport,
            daddr,
            dport,
        })
    }

    /// Could this pattern and `other` ever hand out the same translated
    /// source for the same destination?
    ///
    /// Wildcards are treated as universal on their axis: a wildcard
    /// address matches any address, a wildcard port overlaps any range.
    pub fn possible_conflict(&self, other: &PatternSpec) -> bool {
        axis_may_collide(
            self.saddr,
            self.sport.map(|r| (r.start, r.end)),
            other.saddr,
            other.sport.map(|r| (r.start, r.end)),
        ) && axis_may_collide(
            self.daddr,
            self.dport.map(|p| (p, p)),
            other.daddr,
            other.dport.map(|p| (p, p)),
        )
    }

    /// Will these two patterns necessarily collide? Requires both fully
    /// concrete, equal on addresses and destination port, with one source
    /// range contained in the other.
    pub fn definite_conflict(&self, other: &PatternSpec) -> bool {
        let (Some(saddr), Some(sport), Some(daddr), Some(dport)) =
            (self.saddr, self.sport, self.daddr, self.dport)
        else {
            return false;
        };
        let (Some(osaddr), Some(osport), Some(odaddr), Some(odport)) =
            (other.saddr, other.sport, other.daddr, other.dport)
        else {
            return false;
        };

        saddr == osaddr
            && daddr == odaddr
            && dport == odport
            && ((sport.start <= osport.start && osport.end <= sport.end)
                || (osport.start <= sport.start && sport.end <= osport.end))
    }
}

fn axis_may_collide(
    a_addr: Option<Ipv4Addr>,
    a_ports: Option<(u16, u16)>,
    b_addr: Option<Ipv4Addr>,
    b_ports: Option<(u16, u16)>,
) -> bool {
    if let (Some(a), Some(b)) = (a_addr, b_addr) {
        if a != b {
            return false;
        }
    }
    match (a_ports, b_ports) {
        (Some((al, ah)), Some((bl, bh))) => al <= bh && bl <= ah,
        _ => true,
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.saddr {
            Some(a) => write!(f, "{}:", a)?,
            None => write!(f, "-:")?,
        }
        match self.sport {
            None => write!(f, "-")?,
            Some(r) if r.start == r.end => write!(f, "{}", r.start)?,
            Some(r) => write!(f, "{}-{}", r.start, r.end)?,
        }
        match self.daddr {
            Some(a) => write!(f, " / {}:", a)?,
            None => write!(f, " / -:")?,
        }
        match self.dport {
            Some(p) => write!(f, "{}", p),
            None => write!(f, "-"),
        }
    }
}

/// A configured pattern: the template plus its port-allocation state
#[derive(Debug)]
pub struct Pattern {
    spec: PatternSpec,
    /// Cursor into the circular list of live forward mappings; the most
    /// recently allocated mapping, or none when the list is empty.
    rover: Option<MappingIdx>,
}

impl Pattern {
    pub fn new(spec: PatternSpec) -> Self {
        Self { spec, rover: None }
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn rover(&self) -> Option<MappingIdx> {
        self.rover
    }

    /// Pick an unused source port in `[lo, hi]`.
    ///
    /// Walks the circular list from the rover looking for a gap between
    /// consecutive assigned ports. The rover parks on the node before the
    /// gap, so repeated allocations fill the range monotonically and the
    /// walk is amortized O(1). Returns `None` when the range is full.
    fn find_sport(&mut self, arena: &MappingArena, lo: u16, hi: u16) -> Option<u16> {
        if lo == hi {
            return Some(lo);
        }
        let Some(rover) = self.rover else {
            return Some(lo);
        };

        let mut r = rover;
        let mut port = arena[r].mapto().sport();
        loop {
            let next = arena[r].pat_next();
            let next_port = arena[next].mapto().sport();

            if (next_port as u32) > (port as u32) + 1 {
                // Gap immediately after r.
                self.rover = Some(r);
                return Some(port + 1);
            } else if next_port <= port {
                // The list wraps here.
                if port < hi {
                    self.rover = Some(r);
                    return Some(port + 1);
                } else if next_port > lo {
                    self.rover = Some(r);
                    return Some(lo);
                }
            }

            r = next;
            port = next_port;
            if r == rover {
                return None;
            }
        }
    }

    /// Build a mapping pair for `inbound`, allocating a source port if the
    /// pattern carries a range. Returns `None` when the port pool is full.
    pub fn create_mapping(
        &mut self,
        arena: &mut MappingArena,
        pattern_idx: usize,
        inbound: &FlowId,
        foutput: usize,
        routput: usize,
    ) -> Option<(MappingIdx, MappingIdx)> {
        let new_sport = match self.spec.sport {
            None => inbound.sport(),
            Some(range) => self.find_sport(arena, range.start, range.end)?,
        };
        let new_dport = self.spec.dport.unwrap_or_else(|| inbound.dport());

        let outbound = FlowId::new(
            self.spec.saddr.unwrap_or_else(|| inbound.saddr()),
            new_sport,
            self.spec.daddr.unwrap_or_else(|| inbound.daddr()),
            new_dport,
        );

        let (forward, reverse) =
            arena.insert_pair(inbound, &outbound, Some(pattern_idx), foutput, routput);
        self.link_after_rover(arena, forward);
        self.rover = Some(forward);
        Some((forward, reverse))
    }

    fn link_after_rover(&mut self, arena: &mut MappingArena, idx: MappingIdx) {
        match self.rover {
            None => {
                arena[idx].set_pat_prev(idx);
                arena[idx].set_pat_next(idx);
            }
            Some(r) => {
                let next = arena[r].pat_next();
                arena[idx].set_pat_prev(r);
                arena[idx].set_pat_next(next);
                arena[r].set_pat_next(idx);
                arena[next].set_pat_prev(idx);
            }
        }
    }

    /// Unlink a forward mapping being freed; the rover steps off it first.
    pub fn mapping_freed(&mut self, arena: &mut MappingArena, idx: MappingIdx) {
        if self.rover == Some(idx) {
            let next = arena[idx].pat_next();
            self.rover = if next == idx { None } else { Some(next) };
        }
        let prev = arena[idx].pat_prev();
        let next = arena[idx].pat_next();
        arena[next].set_pat_prev(prev);
        arena[prev].set_pat_next(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(words: &[&str]) -> PatternSpec {
        PatternSpec::parse(words).unwrap()
    }

    fn inbound(sport: u16) -> FlowId {
        FlowId::new(
            Ipv4Addr::new(192, 168, 1, 5),
            sport,
            Ipv4Addr::new(8, 8, 8, 8),
            80,
        )
    }

    #[test]
    fn test_parse_full() {
        let p = spec(&["1.2.3.4", "50000-50002", "10.0.0.1", "80"]);
        assert_eq!(p.saddr, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(p.sport, Some(PortRange::new(50000, 50002)));
        assert_eq!(p.daddr, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(p.dport, Some(80));
    }

    #[test]
    fn test_parse_wildcards() {
        let p = spec(&["-", "-", "-", "-"]);
        assert_eq!(p.saddr, None);
        assert_eq!(p.sport, None);
        assert_eq!(p.daddr, None);
        assert_eq!(p.dport, None);
    }

    #[test]
    fn test_parse_single_sport() {
        let p = spec(&["-", "8080", "-", "-"]);
        assert_eq!(p.sport, Some(PortRange::single(8080)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(PatternSpec::parse(&["1.2.3.4", "80", "-"]).is_err());
        assert!(PatternSpec::parse(&["bogus", "80", "-", "-"]).is_err());
        assert!(PatternSpec::parse(&["-", "99999", "-", "-"]).is_err());
        assert!(PatternSpec::parse(&["-", "500-100", "-", "-"]).is_err());
        assert!(PatternSpec::parse(&["-", "x-y", "-", "-"]).is_err());
        assert!(PatternSpec::parse(&["-", "-", "-", "http"]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            spec(&["1.2.3.4", "50000-50002", "10.0.0.1", "80"]).to_string(),
            "1.2.3.4:50000-50002 / 10.0.0.1:80"
        );
        assert_eq!(spec(&["-", "-", "-", "-"]).to_string(), "-:- / -:-");
        assert_eq!(spec(&["-", "8080", "-", "-"]).to_string(), "-:8080 / -:-");
    }

    #[test]
    fn test_possible_conflict_overlapping_ranges() {
        let a = spec(&["1.2.3.4", "1000-2000", "-", "-"]);
        let b = spec(&["1.2.3.4", "1500-2500", "-", "-"]);
        assert!(a.possible_conflict(&b));
        assert!(b.possible_conflict(&a));
    }

    #[test]
    fn test_possible_conflict_disjoint_ranges() {
        let a = spec(&["1.2.3.4", "1000-2000", "-", "-"]);
        let b = spec(&["1.2.3.4", "3000-4000", "-", "-"]);
        assert!(!a.possible_conflict(&b));
    }

    #[test]
    fn test_possible_conflict_different_saddr() {
        let a = spec(&["1.2.3.4", "1000-2000", "-", "-"]);
        let b = spec(&["5.6.7.8", "1000-2000", "-", "-"]);
        assert!(!a.possible_conflict(&b));
    }

    #[test]
    fn test_possible_conflict_wildcards_are_universal() {
        // A wildcard source port overlaps any range; a wildcard dest port
        // conflicts with any dest-port-specific pattern.
        let a = spec(&["1.2.3.4", "-", "10.0.0.1", "-"]);
        let b = spec(&["1.2.3.4", "1000-2000", "10.0.0.1", "80"]);
        assert!(a.possible_conflict(&b));
        assert!(b.possible_conflict(&a));
    }

    #[test]
    fn test_definite_conflict_contained_range() {
        let a = spec(&["1.2.3.4", "1000-2000", "10.0.0.1", "80"]);
        let b = spec(&["1.2.3.4", "1200-1800", "10.0.0.1", "80"]);
        assert!(a.definite_conflict(&b));
        assert!(b.definite_conflict(&a));
    }

    #[test]
    fn test_definite_conflict_needs_concrete_fields() {
        let a = spec(&["1.2.3.4", "1000-2000", "10.0.0.1", "80"]);
        let b = spec(&["1.2.3.4", "1000-2000", "10.0.0.1", "-"]);
        assert!(!a.definite_conflict(&b));
        assert!(!b.definite_conflict(&a));

        // Overlap without containment is not definite.
        let c = spec(&["1.2.3.4", "1500-2500", "10.0.0.1", "80"]);
        assert!(!a.definite_conflict(&c));
    }

    #[test]
    fn test_create_mapping_wildcards_keep_inbound_fields() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["-", "-", "10.0.0.1", "8080"]));

        let (f, _) = pat
            .create_mapping(&mut arena, 0, &inbound(5000), 0, 1)
            .unwrap();
        let mapto = arena[f].mapto();
        assert_eq!(mapto.saddr(), Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(mapto.sport(), 5000);
        assert_eq!(mapto.daddr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(mapto.dport(), 8080);
    }

    #[test]
    fn test_port_allocation_fills_range_in_order() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["1.2.3.4", "50000-50002", "-", "-"]));

        let mut ports = Vec::new();
        for sport in [5000, 5001, 5002] {
            let (f, _) = pat
                .create_mapping(&mut arena, 0, &inbound(sport), 0, 1)
                .unwrap();
            ports.push(arena[f].mapto().sport());
        }
        assert_eq!(ports, vec![50000, 50001, 50002]);

        // Pool exhausted.
        assert!(pat
            .create_mapping(&mut arena, 0, &inbound(5003), 0, 1)
            .is_none());
    }

    #[test]
    fn test_port_allocation_reuses_freed_middle_port() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["1.2.3.4", "50000-50002", "-", "-"]));

        let mut forwards = Vec::new();
        for sport in [5000, 5001, 5002] {
            let (f, r) = pat
                .create_mapping(&mut arena, 0, &inbound(sport), 0, 1)
                .unwrap();
            forwards.push((f, r));
        }

        // Free the middle mapping (port 50001).
        let (f1, r1) = forwards[1];
        pat.mapping_freed(&mut arena, f1);
        arena.remove(r1);
        arena.remove(f1);

        let (f, _) = pat
            .create_mapping(&mut arena, 0, &inbound(6000), 0, 1)
            .unwrap();
        assert_eq!(arena[f].mapto().sport(), 50001);
    }

    #[test]
    fn test_port_allocation_never_duplicates_live_port() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["1.2.3.4", "40000-40009", "-", "-"]));

        let mut seen = Vec::new();
        for sport in 0..10u16 {
            let (f, _) = pat
                .create_mapping(&mut arena, 0, &inbound(10000 + sport), 0, 1)
                .unwrap();
            let port = arena[f].mapto().sport();
            assert!((40000..=40009).contains(&port));
            assert!(!seen.contains(&port));
            seen.push(port);
        }
    }

    #[test]
    fn test_single_port_pattern_always_allocates() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["1.2.3.4", "50000", "-", "-"]));

        let (f1, _) = pat
            .create_mapping(&mut arena, 0, &inbound(5000), 0, 1)
            .unwrap();
        let (f2, _) = pat
            .create_mapping(&mut arena, 0, &inbound(5001), 0, 1)
            .unwrap();
        assert_eq!(arena[f1].mapto().sport(), 50000);
        assert_eq!(arena[f2].mapto().sport(), 50000);
    }

    #[test]
    fn test_rover_steps_off_freed_mapping() {
        let mut arena = MappingArena::new();
        let mut pat = Pattern::new(spec(&["1.2.3.4", "50000-50005", "-", "-"]));

        let (f0, _) = pat
            .create_mapping(&mut arena, 0, &inbound(5000), 0, 1)
            .unwrap();
        let (f1, r1) = pat
            .create_mapping(&mut arena, 0, &inbound(5001), 0, 1)
            .unwrap();
        assert_eq!(pat.rover(), Some(f1));

        pat.mapping_freed(&mut arena, f1);
        arena.remove(r1);
        arena.remove(f1);
        assert_eq!(pat.rover(), Some(f0));

        // List of one: freeing the last mapping empties the rover.
        pat.mapping_freed(&mut arena, f0);
        assert_eq!(pat.rover(), None);
    }
}
