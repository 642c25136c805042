/// Lookup structures for one match, built once before fight detection.
///
/// All state is owned by the single match-processing unit that built it.
/// Nothing here is shared across matches, so no locking is needed.
use crate::{
    config::AppConfig,
    identity::IdentityIndex,
    loadout::LoadoutTimeline,
    parser::{LogEvent, MatchLog, SlotId, Tick},
    snapshot::SnapshotTable,
};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Spawn / life index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SpawnIndex {
    by_slot: BTreeMap<SlotId, Vec<Tick>>,
}

impl SpawnIndex {
    pub fn build(events: &[LogEvent]) -> Self {
        let mut by_slot: BTreeMap<SlotId, Vec<Tick>> = BTreeMap::new();
        for event in events {
            if let LogEvent::Spawn { tick, slot } = event {
                by_slot.entry(*slot).or_default().push(*tick);
            }
        }
        for ticks in by_slot.values_mut() {
            ticks.sort_unstable();
        }
        Self { by_slot }
    }

    pub fn spawns(&self, slot: SlotId) -> &[Tick] {
        self.by_slot.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent spawn at or before `tick`, ignoring spawns that predate
    /// `session_start` (those belong to a previous login on this slot).
    pub fn last_spawn(&self, slot: SlotId, tick: Tick, session_start: Tick) -> Option<Tick> {
        let spawns = self.spawns(slot);
        let upto = spawns.partition_point(|&s| s <= tick);
        spawns[..upto]
            .last()
            .copied()
            .filter(|&s| s >= session_start)
    }
}

// ---------------------------------------------------------------------------
// MatchState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MatchState {
    pub identity:  IdentityIndex,
    pub loadout:   LoadoutTimeline,
    pub spawns:    SpawnIndex,
    pub snapshots: SnapshotTable,
}

impl MatchState {
    pub fn build(log: &MatchLog, snapshots: SnapshotTable, cfg: &AppConfig) -> Self {
        let match_end = log.last_tick().or_else(|| snapshots.max_tick()).unwrap_or(0);
        let identity = IdentityIndex::build(&log.events, match_end, snapshots.slots());
        let loadout = LoadoutTimeline::build(&log.events, &cfg.default_item);
        let spawns = SpawnIndex::build(&log.events);

        tracing::debug!("Match state built: match_end={} events={}", match_end, log.events.len());
        Self { identity, loadout, spawns, snapshots }
    }

    pub fn match_end(&self) -> Tick {
        self.identity.match_end()
    }
}
