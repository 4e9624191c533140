//! Per-protocol flow tables
//!
//! Maps the 5-tuple a packet presents to the arena index of the mapping
//! that rewrites it. Both directions of a pair are installed together and
//! collected together. GC leaves explicit `None` tombstones so a flow
//! freed mid-tick cannot be transparently re-created by a racing mapper.

use super::flow::FlowId;
use super::mapping::{MappingArena, MappingIdx};
use super::pattern::Pattern;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct FlowTable {
    map: HashMap<FlowId, Option<MappingIdx>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the mapping for an inbound flow. Tombstones miss.
    pub fn lookup(&self, flow: &FlowId) -> Option<MappingIdx> {
        self.map.get(flow).copied().flatten()
    }

    /// Install a mapping pair.
    ///
    /// Forward traffic arrives keyed as the reversal of the reverse
    /// mapping's rewrite target; return traffic as the reversal of the
    /// forward's. Installing under those two keys makes each direction's
    /// lookup land on its own mapping.
    pub fn install(&mut self, arena: &MappingArena, forward: MappingIdx, reverse: MappingIdx) {
        let forward_key = arena[reverse].mapto().rev();
        let reverse_key = arena[forward].mapto().rev();
        self.map.insert(forward_key, Some(forward));
        self.map.insert(reverse_key, Some(reverse));
    }

    /// Collect idle mapping pairs. Returns the number of pairs freed.
    ///
    /// Pass 1 scans every live entry: a forward whose pair saw no traffic
    /// since the last tick is scheduled; otherwise both `used` flags are
    /// cleared, so activity in either direction buys the pair one more
    /// interval. Pass 2 unlinks each scheduled pair from its pattern,
    /// tombstones both keys and frees both arena slots.
    pub fn gc(&mut self, arena: &mut MappingArena, patterns: &mut [Pattern]) -> usize {
        let live: Vec<MappingIdx> = self.map.values().filter_map(|v| *v).collect();

        let mut to_free: Vec<MappingIdx> = Vec::new();
        for idx in live {
            if arena[idx].is_reverse() {
                continue;
            }
            let reverse = arena[idx].reverse();
            if !arena[idx].used() && !arena[reverse].used() {
                to_free.push(idx);
            } else {
                arena[idx].clear_used();
                arena[reverse].clear_used();
            }
        }

        for forward in &to_free {
            let forward = *forward;
            let reverse = arena[forward].reverse();
            if let Some(pidx) = arena[forward].pattern() {
                patterns[pidx].mapping_freed(arena, forward);
            }
            self.map.insert(arena[reverse].mapto().rev(), None);
            self.map.insert(arena[forward].mapto().rev(), None);
            arena.remove(reverse);
            arena.remove(forward);
        }

        to_free.len()
    }

    /// Free every pair without tombstoning. Element teardown.
    pub fn clear(&mut self, arena: &mut MappingArena, patterns: &mut [Pattern]) {
        let forwards: Vec<MappingIdx> = self
            .map
            .values()
            .filter_map(|v| *v)
            .filter(|&idx| arena[idx].is_forward())
            .collect();

        for forward in forwards {
            let reverse = arena[forward].reverse();
            if let Some(pidx) = arena[forward].pattern() {
                patterns[pidx].mapping_freed(arena, forward);
            }
            arena.remove(reverse);
            arena.remove(forward);
        }
        self.map.clear();
    }

    /// Live (non-tombstone) entries: two per mapping pair.
    pub fn live_len(&self) -> usize {
        self.map.values().filter(|v| v.is_some()).count()
    }

    /// Tombstones left by GC since the last rehash.
    pub fn tombstone_len(&self) -> usize {
        self.map.values().filter(|v| v.is_none()).count()
    }

    /// Iterate live entries as (inbound key, mapping index).
    pub fn entries(&self) -> impl Iterator<Item = (&FlowId, MappingIdx)> {
        self.map
            .iter()
            .filter_map(|(flow, idx)| idx.map(|i| (flow, i)))
    }
}
