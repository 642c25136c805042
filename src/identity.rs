/// Identity resolution: which username held a slot id at a given tick.
///
/// Slot ids are per-login and get reused when a player leaves and someone
/// else joins, so every lookup is keyed on (slot, tick). Join/leave events
/// build time-bounded intervals per slot:
///
///   join   -> clamp the slot's latest interval to the join tick if it still
///             covers it, then open [tick, match_end] for the new username
///   leave  -> close the most recent interval containing the leave tick
///
/// Intervals live in an append-only arena; `by_slot` holds arena indices in
/// start order. A slot that only shows up in snapshot data gets one synthetic
/// interval spanning the match.
use crate::parser::{LogEvent, SlotId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInterval {
    pub slot:     SlotId,
    pub start:    Tick,
    pub end:      Tick,
    pub username: String,
}

impl IdentityInterval {
    pub fn contains(&self, tick: Tick) -> bool {
        self.start <= tick && tick <= self.end
    }
}

/// Deterministic label for a slot nobody ever joined on.
pub fn placeholder(slot: SlotId) -> String {
    format!("Unknown_{}", slot)
}

#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    intervals: Vec<IdentityInterval>,
    by_slot:   BTreeMap<SlotId, Vec<usize>>,
    /// username -> slots they were seen on, in first-join order
    by_user:   BTreeMap<String, Vec<SlotId>>,
    match_end: Tick,
}

impl IdentityIndex {
    pub fn new(match_end: Tick) -> Self {
        Self { match_end, ..Default::default() }
    }

    /// Build from the match's join/leave events plus any slot ids that appear
    /// in the snapshot table. Events are applied in tick order.
    pub fn build(
        events:         &[LogEvent],
        match_end:      Tick,
        snapshot_slots: impl IntoIterator<Item = SlotId>,
    ) -> Self {
        let mut index = Self::new(match_end);

        let mut session_events: Vec<&LogEvent> = events
            .iter()
            .filter(|e| matches!(e, LogEvent::Join { .. } | LogEvent::Leave { .. }))
            .collect();
        session_events.sort_by_key(|e| e.tick());

        for event in session_events {
            match event {
                LogEvent::Join { tick, slot, username } => index.join(*slot, *tick, username),
                LogEvent::Leave { tick, slot } => index.leave(*slot, *tick),
                _ => {}
            }
        }

        for slot in snapshot_slots {
            index.ensure_slot(slot);
        }

        tracing::debug!(
            "Identity index: {} intervals over {} slots, {} usernames",
            index.intervals.len(),
            index.by_slot.len(),
            index.by_user.len()
        );
        index
    }

    pub fn join(&mut self, slot: SlotId, tick: Tick, username: &str) {
        if let Some(&last) = self.by_slot.get(&slot).and_then(|ids| ids.last()) {
            let prev = &mut self.intervals[last];
            if prev.end >= tick {
                // missing or late leave: cut the old session at the new join
                prev.end = tick.max(prev.start);
            }
        }

        let id = self.intervals.len();
        self.intervals.push(IdentityInterval {
            slot,
            start: tick,
            end: self.match_end.max(tick),
            username: username.to_owned(),
        });
        self.by_slot.entry(slot).or_default().push(id);

        let slots = self.by_user.entry(username.to_owned()).or_default();
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }

    pub fn leave(&mut self, slot: SlotId, tick: Tick) {
        let Some(ids) = self.by_slot.get(&slot) else {
            tracing::debug!("Leave for never-joined slot {} at {}", slot, tick);
            return;
        };
        if let Some(&id) = ids.iter().rev().find(|&&id| self.intervals[id].contains(tick)) {
            self.intervals[id].end = tick;
        }
    }

    /// Synthesize a whole-match interval for a slot without any join.
    pub fn ensure_slot(&mut self, slot: SlotId) {
        if self.by_slot.contains_key(&slot) {
            return;
        }
        let id = self.intervals.len();
        self.intervals.push(IdentityInterval {
            slot,
            start: 0,
            end: self.match_end,
            username: placeholder(slot),
        });
        self.by_slot.insert(slot, vec![id]);
    }

    pub fn is_known(&self, slot: SlotId) -> bool {
        self.by_slot.contains_key(&slot)
    }

    pub fn match_end(&self) -> Tick {
        self.match_end
    }

    /// All intervals recorded for `slot`, oldest first.
    pub fn intervals(&self, slot: SlotId) -> impl Iterator<Item = &IdentityInterval> {
        self.by_slot
            .get(&slot)
            .into_iter()
            .flatten()
            .map(move |&id| &self.intervals[id])
    }

    /// Interval whose bounds contain `tick`. When two sessions share a
    /// boundary tick the newer one wins.
    pub fn containing(&self, slot: SlotId, tick: Tick) -> Option<&IdentityInterval> {
        self.by_slot
            .get(&slot)?
            .iter()
            .rev()
            .map(|&id| &self.intervals[id])
            .find(|iv| iv.contains(tick))
    }

    /// Containing interval, or the slot's last interval when `tick` falls
    /// outside every recorded one.
    pub fn session(&self, slot: SlotId, tick: Tick) -> Option<&IdentityInterval> {
        self.containing(slot, tick).or_else(|| {
            self.by_slot
                .get(&slot)
                .and_then(|ids| ids.last())
                .map(|&id| &self.intervals[id])
        })
    }

    /// Username holding `slot` at `tick`. Never fails: ticks outside every
    /// interval clamp to the last holder, unknown slots get a placeholder.
    pub fn resolve(&self, slot: SlotId, tick: Tick) -> String {
        self.session(slot, tick)
            .map(|iv| iv.username.clone())
            .unwrap_or_else(|| placeholder(slot))
    }

    /// Start tick of the login session owning `tick` (0 for unknown slots).
    pub fn session_start(&self, slot: SlotId, tick: Tick) -> Tick {
        self.session(slot, tick).map(|iv| iv.start).unwrap_or(0)
    }

    /// Usernames that joined at least once, with the slots they used.
    pub fn usernames(&self) -> impl Iterator<Item = (&str, &[SlotId])> {
        self.by_user.iter().map(|(u, s)| (u.as_str(), s.as_slice()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn join(tick: Tick, slot: SlotId, name: &str) -> LogEvent {
        LogEvent::Join { tick, slot, username: name.into() }
    }

    #[test]
    fn resolves_inside_intervals() {
        let events = vec![
            join(0, 1, "A"),
            LogEvent::Leave { tick: 300, slot: 1 },
            join(500, 1, "B"),
        ];
        let idx = IdentityIndex::build(&events, 1000, []);
        assert_eq!(idx.resolve(1, 0), "A");
        assert_eq!(idx.resolve(1, 299), "A");
        assert_eq!(idx.resolve(1, 750), "B");
        assert_eq!(idx.session_start(1, 750), 500);
        assert_eq!(idx.session_start(1, 100), 0);
    }

    #[test]
    fn out_of_range_clamps_to_last_holder() {
        let events = vec![join(50, 1, "A"), LogEvent::Leave { tick: 100, slot: 1 }, join(200, 1, "B")];
        let idx = IdentityIndex::build(&events, 400, []);
        // before the first interval and inside the gap
        assert_eq!(idx.resolve(1, 10), "B");
        assert_eq!(idx.resolve(1, 150), "B");
        assert_eq!(idx.session_start(1, 150), 200);
    }

    #[test]
    fn rejoin_without_leave_clamps_previous_session() {
        let events = vec![join(0, 4, "A"), join(100, 4, "B")];
        let idx = IdentityIndex::build(&events, 1000, []);
        let ivs: Vec<_> = idx.intervals(4).collect();
        assert_eq!(ivs.len(), 2);
        assert_eq!((ivs[0].start, ivs[0].end), (0, 100));
        assert_eq!((ivs[1].start, ivs[1].end), (100, 1000));
        // shared boundary belongs to the new session
        assert_eq!(idx.resolve(4, 100), "B");
        assert_eq!(idx.resolve(4, 99), "A");
    }

    #[test]
    fn intervals_never_overlap() {
        let events = vec![
            join(0, 2, "A"),
            join(10, 2, "B"),
            LogEvent::Leave { tick: 20, slot: 2 },
            join(20, 2, "C"),
            join(40, 2, "D"),
        ];
        let idx = IdentityIndex::build(&events, 100, []);
        let ivs: Vec<_> = idx.intervals(2).collect();
        for pair in ivs.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert_eq!(ivs.last().map(|iv| iv.end), Some(100));
    }

    #[test]
    fn snapshot_only_slot_gets_placeholder() {
        let idx = IdentityIndex::build(&[join(0, 1, "A")], 500, [1, 7]);
        assert!(idx.is_known(7));
        assert_eq!(idx.resolve(7, 250), "Unknown_7");
        assert_eq!(idx.session_start(7, 250), 0);
        // joined slots are not overwritten
        assert_eq!(idx.resolve(1, 250), "A");
    }

    #[test]
    fn unknown_slot_resolves_to_placeholder() {
        let idx = IdentityIndex::new(100);
        assert!(!idx.is_known(3));
        assert_eq!(idx.resolve(3, 10), "Unknown_3");
        assert_eq!(idx.session_start(3, 10), 0);
    }

    #[test]
    fn usernames_track_all_slots() {
        let events = vec![join(0, 1, "A"), LogEvent::Leave { tick: 50, slot: 1 }, join(60, 3, "A")];
        let idx = IdentityIndex::build(&events, 100, []);
        let users: Vec<_> = idx.usernames().collect();
        assert_eq!(users, vec![("A", &[1, 3][..])]);
    }
}
