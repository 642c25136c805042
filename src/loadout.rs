/// Per-slot equip history: what each slot was holding at any tick.
///
/// Lookups are scoped to the login session owning the query tick, so an
/// item equipped by the slot's previous owner never leaks into the next one.
use crate::identity::IdentityIndex;
use crate::parser::{LogEvent, SlotId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadoutEntry {
    pub slot: SlotId,
    pub tick: Tick,
    pub item: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadoutTimeline {
    by_slot:      BTreeMap<SlotId, Vec<LoadoutEntry>>,
    default_item: String,
}

impl LoadoutTimeline {
    pub fn build(events: &[LogEvent], default_item: &str) -> Self {
        let mut by_slot: BTreeMap<SlotId, Vec<LoadoutEntry>> = BTreeMap::new();
        for event in events {
            if let LogEvent::Equip { tick, slot, item } = event {
                by_slot.entry(*slot).or_default().push(LoadoutEntry {
                    slot: *slot,
                    tick: *tick,
                    item: item.clone().unwrap_or_else(|| default_item.to_owned()),
                });
            }
        }
        for entries in by_slot.values_mut() {
            entries.sort_by_key(|e| e.tick);
        }
        Self { by_slot, default_item: default_item.to_owned() }
    }

    pub fn entries(&self, slot: SlotId) -> &[LoadoutEntry] {
        self.by_slot.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Item held by `slot` at `tick`: the latest equip inside the current
    /// session, or the default label.
    pub fn current_item(&self, identity: &IdentityIndex, slot: SlotId, tick: Tick) -> &str {
        let session_start = identity.session_start(slot, tick);
        self.entries(slot)
            .iter()
            .rev()
            .find(|e| session_start <= e.tick && e.tick <= tick)
            .map(|e| e.item.as_str())
            .unwrap_or(&self.default_item)
    }

    /// Every entry with the ticks it was held for: up to the slot's next
    /// equip, or to the end of its owning session for the last one.
    pub fn held_spans<'a>(
        &'a self,
        identity: &'a IdentityIndex,
    ) -> impl Iterator<Item = (&'a LoadoutEntry, Tick)> + 'a {
        let match_end = identity.match_end();
        self.by_slot.values().flat_map(move |entries| {
            entries.iter().enumerate().map(move |(i, entry)| {
                let end = match entries.get(i + 1) {
                    Some(next) => next.tick,
                    None => identity
                        .containing(entry.slot, entry.tick)
                        .map(|iv| iv.end)
                        .unwrap_or(match_end)
                        .min(match_end),
                };
                (entry, (end - entry.tick).max(0))
            })
        })
    }
}
