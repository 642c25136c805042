/// Fight detector: one chronological scan that turns combat events into
/// closed pairwise engagements.
///
/// Per unordered slot pair the state is either absent (no entry in `open`)
/// or an `OpenFight` accumulating damage. Transitions:
///
///   attack action by P  -> refresh `last_action_time` of every open fight with P
///   damage I -> T       -> open the pair (start = earliest attack by either
///                          side inside the lookback window) or add to it
///   elim of P           -> close every open fight with P as `death`,
///                          winner = the other participant
///   before each event   -> close fights idle longer than the timeout window
///                          as `timeout`, ending at their last action
///   end of scan         -> close whatever is still open as `timeout`
///
/// Closing is a by-value transition `OpenFight -> ClosedFight`; an open fight
/// is never mutated after it leaves the map.
///
/// Three-way brawls produce independent, possibly overlapping pairwise fights.
/// They are not merged.
use crate::{
    config::AppConfig,
    identity::IdentityIndex,
    parser::{LogEvent, SlotId, Tick},
    rules::RuleTable,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unordered participant pair, stored low slot first.
pub type PairKey = (SlotId, SlotId);

pub fn pair_key(a: SlotId, b: SlotId) -> PairKey {
    if a <= b { (a, b) } else { (b, a) }
}

/// participant slot -> item -> damage dealt
pub type DamageMap = BTreeMap<SlotId, BTreeMap<String, f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Death,
    Timeout,
}

/// The damage event that opened a fight, kept for start-health recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FirstHit {
    pub target:      SlotId,
    pub prev_health: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenFight {
    pub id:               String,
    pub pair:             PairKey,
    pub start_time:       Tick,
    pub last_action_time: Tick,
    pub damage_total:     f64,
    pub damage:           DamageMap,
    pub first_hit:        FirstHit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedFight {
    pub id:           String,
    pub pair:         PairKey,
    pub start_time:   Tick,
    pub end_time:     Tick,
    pub end_reason:   EndReason,
    pub winner:       Option<SlotId>,
    pub damage_total: f64,
    pub damage:       DamageMap,
    pub first_hit:    FirstHit,
}

impl OpenFight {
    pub fn involves(&self, slot: SlotId) -> bool {
        self.pair.0 == slot || self.pair.1 == slot
    }

    fn record_damage(&mut self, instigator: SlotId, item: String, amount: f64, tick: Tick) {
        self.last_action_time = tick;
        self.damage_total += amount;
        *self
            .damage
            .entry(instigator)
            .or_default()
            .entry(item)
            .or_insert(0.0) += amount;
    }

    /// Seal the fight.
    pub fn close(self, end_time: Tick, end_reason: EndReason, winner: Option<SlotId>) -> ClosedFight {
        ClosedFight {
            id:           self.id,
            pair:         self.pair,
            start_time:   self.start_time,
            end_time,
            end_reason,
            winner,
            damage_total: self.damage_total,
            damage:       self.damage,
            first_hit:    self.first_hit,
        }
    }

    fn time_out(self) -> ClosedFight {
        let end = self.last_action_time;
        self.close(end, EndReason::Timeout, None)
    }
}

impl ClosedFight {
    /// The participant that is not `slot`.
    pub fn opponent(&self, slot: SlotId) -> SlotId {
        if self.pair.0 == slot { self.pair.1 } else { self.pair.0 }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct FightDetector<'a> {
    identity: &'a IdentityIndex,
    rules:    &'a RuleTable,
    cfg:      &'a AppConfig,
    match_id: &'a str,
    /// slot -> sorted attack action ticks, for the lookback search
    actions:  BTreeMap<SlotId, Vec<Tick>>,
    open:     BTreeMap<PairKey, OpenFight>,
    closed:   Vec<ClosedFight>,
}

impl<'a> FightDetector<'a> {
    pub fn new(
        identity: &'a IdentityIndex,
        rules:    &'a RuleTable,
        cfg:      &'a AppConfig,
        match_id: &'a str,
    ) -> Self {
        Self {
            identity,
            rules,
            cfg,
            match_id,
            actions: BTreeMap::new(),
            open:    BTreeMap::new(),
            closed:  Vec::new(),
        }
    }

    /// Scan the match and return every fight, in the order they closed.
    pub fn run(mut self, events: &[LogEvent]) -> Vec<ClosedFight> {
        for event in events {
            if let LogEvent::Attack { tick, slot, .. } = event {
                self.actions.entry(*slot).or_default().push(*tick);
            }
        }
        for ticks in self.actions.values_mut() {
            ticks.sort_unstable();
        }

        let mut timeline: Vec<&LogEvent> = events.iter().filter(|e| e.is_combat()).collect();
        timeline.sort_by_key(|e| e.tick());

        for event in timeline {
            let now = event.tick();
            self.sweep_timeouts(now);

            match event {
                LogEvent::Attack { slot, .. } => self.on_attack(*slot, now),
                LogEvent::Damage { instigator, target, amount, item, causer, prev_health, .. } => {
                    let (Some(instigator), Some(target)) = (*instigator, *target) else {
                        continue;
                    };
                    let item = self.rules.attribute(item.as_deref(), causer.as_deref(), &self.cfg.unknown_item);
                    self.on_damage(instigator, target, *amount, item, *prev_health, now);
                }
                LogEvent::Elim { target: Some(target), .. } => self.on_elim(*target, now),
                _ => {}
            }
        }

        let remaining = std::mem::take(&mut self.open);
        self.closed.extend(remaining.into_values().map(OpenFight::time_out));

        tracing::debug!("Detector closed {} fights for match {}", self.closed.len(), self.match_id);
        self.closed
    }

    fn sweep_timeouts(&mut self, now: Tick) {
        let timeout = self.cfg.timeout_ticks;
        let stale: Vec<PairKey> = self
            .open
            .iter()
            .filter(|(_, f)| now > f.last_action_time.saturating_add(timeout))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(fight) = self.open.remove(&key) {
                tracing::debug!("Fight {} timed out at {}", fight.id, fight.last_action_time);
                self.closed.push(fight.time_out());
            }
        }
    }

    fn on_attack(&mut self, slot: SlotId, now: Tick) {
        for fight in self.open.values_mut().filter(|f| f.involves(slot)) {
            fight.last_action_time = now;
        }
    }

    fn on_damage(
        &mut self,
        instigator:  SlotId,
        target:      SlotId,
        amount:      f64,
        item:        String,
        prev_health: Option<f64>,
        now:         Tick,
    ) {
        if instigator == target {
            return;
        }
        if !self.identity.is_known(instigator) || !self.identity.is_known(target) {
            return;
        }

        let key = pair_key(instigator, target);
        if let Some(fight) = self.open.get_mut(&key) {
            fight.record_damage(instigator, item, amount, now);
            return;
        }

        let id = format!("{}_{}", self.match_id, self.closed.len() + self.open.len());
        let start_time = self.lookback_start(key, now);
        let mut fight = OpenFight {
            id,
            pair: key,
            start_time,
            last_action_time: now,
            damage_total: 0.0,
            damage: BTreeMap::from([(instigator, BTreeMap::new()), (target, BTreeMap::new())]),
            first_hit: FirstHit { target, prev_health },
        };
        fight.record_damage(instigator, item, amount, now);
        tracing::debug!("Fight {} opened {:?} start={} hit={}", fight.id, key, start_time, now);
        self.open.insert(key, fight);
    }

    fn on_elim(&mut self, target: SlotId, now: Tick) {
        let ended: Vec<PairKey> = self
            .open
            .keys()
            .filter(|(a, b)| *a == target || *b == target)
            .copied()
            .collect();
        for key in ended {
            if let Some(fight) = self.open.remove(&key) {
                let winner = if key.0 == target { key.1 } else { key.0 };
                tracing::debug!("Fight {} ended by death of slot {}", fight.id, target);
                self.closed.push(fight.close(now, EndReason::Death, Some(winner)));
            }
        }
    }

    /// Earliest attack by either side in `[now - lookback, now]`, else `now`.
    fn lookback_start(&self, pair: PairKey, now: Tick) -> Tick {
        let window_start = now.saturating_sub(self.cfg.lookback_ticks);
        [pair.0, pair.1]
            .iter()
            .filter_map(|slot| self.actions.get(slot))
            .filter_map(|ticks| {
                let first = ticks.partition_point(|&t| t < window_start);
                ticks.get(first).copied().filter(|&t| t <= now)
            })
            .min()
            .unwrap_or(now)
    }
}

/// Convenience wrapper: run a detector over the whole event list.
pub fn detect_fights(
    events:   &[LogEvent],
    identity: &IdentityIndex,
    rules:    &RuleTable,
    cfg:      &AppConfig,
    match_id: &str,
) -> Vec<ClosedFight> {
    FightDetector::new(identity, rules, cfg, match_id).run(events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::AttackKind;

    fn join(tick: Tick, slot: SlotId, name: &str) -> LogEvent {
        LogEvent::Join { tick, slot, username: name.into() }
    }

    fn fire(tick: Tick, slot: SlotId) -> LogEvent {
        LogEvent::Attack { tick, slot, kind: AttackKind::Fire }
    }

    fn hit(tick: Tick, from: SlotId, to: SlotId, amount: f64) -> LogEvent {
        LogEvent::Damage {
            tick,
            instigator: Some(from),
            target: Some(to),
            amount,
            item: Some("Ripper".into()),
            causer: None,
            prev_health: None,
        }
    }

    fn elim(tick: Tick, target: SlotId) -> LogEvent {
        LogEvent::Elim { tick, instigator: None, target: Some(target), item: None }
    }

    fn detect(events: &[LogEvent]) -> Vec<ClosedFight> {
        let end = events.iter().map(LogEvent::tick).max().unwrap_or(0);
        let identity = IdentityIndex::build(events, end, []);
        let cfg = AppConfig::default();
        detect_fights(events, &identity, RuleTable::embedded(), &cfg, "m1")
    }

    fn players(mut rest: Vec<LogEvent>) -> Vec<LogEvent> {
        let mut events = vec![join(0, 1, "A"), join(0, 2, "B"), join(0, 3, "C")];
        events.append(&mut rest);
        events
    }

    fn sum_entries(f: &ClosedFight) -> f64 {
        f.damage.values().flat_map(|m| m.values()).sum()
    }

    #[test]
    fn lookback_finds_opening_attack_and_elim_closes() {
        let fights = detect(&players(vec![fire(100, 1), hit(110, 1, 2, 5.0), elim(115, 2)]));
        assert_eq!(fights.len(), 1);
        let f = &fights[0];
        assert_eq!(f.start_time, 100);
        assert_eq!(f.end_time, 115);
        assert_eq!(f.end_reason, EndReason::Death);
        assert_eq!(f.winner, Some(1));
        assert_eq!(f.pair, (1, 2));
        assert_eq!(f.id, "m1_0");
    }

    #[test]
    fn lone_hit_times_out_at_itself() {
        let fights = detect(&players(vec![hit(1000, 1, 2, 10.0)]));
        assert_eq!(fights.len(), 1);
        assert_eq!(fights[0].end_reason, EndReason::Timeout);
        assert_eq!(fights[0].start_time, 1000);
        assert_eq!(fights[0].end_time, 1000);
        assert_eq!(fights[0].winner, None);
    }

    #[test]
    fn gap_longer_than_timeout_splits_fights() {
        let fights = detect(&players(vec![hit(0, 1, 2, 5.0), hit(500, 1, 2, 5.0)]));
        assert_eq!(fights.len(), 2);
        assert_eq!((fights[0].start_time, fights[0].end_time), (0, 0));
        assert_eq!((fights[1].start_time, fights[1].end_time), (500, 500));
        assert_ne!(fights[0].id, fights[1].id);
    }

    #[test]
    fn attacks_keep_a_fight_alive() {
        let fights = detect(&players(vec![
            hit(0, 1, 2, 5.0),
            fire(200, 2),
            fire(400, 1),
            hit(600, 2, 1, 7.0),
        ]));
        assert_eq!(fights.len(), 1);
        assert_eq!(fights[0].end_time, 600);
        assert_eq!(fights[0].damage_total, 12.0);
        assert_eq!(fights[0].damage[&2]["Ripper"], 7.0);
    }

    #[test]
    fn lookback_ignores_actions_outside_window() {
        let fights = detect(&players(vec![fire(0, 1), fire(50, 2), hit(160, 1, 2, 5.0)]));
        // 160 - 120 = 40: the action at 0 is too old, 50 qualifies
        assert_eq!(fights[0].start_time, 50);
    }

    #[test]
    fn lookback_window_is_inclusive_at_both_ends() {
        // exactly lookback ticks before the hit
        let fights = detect(&players(vec![fire(80, 2), hit(200, 1, 2, 5.0)]));
        assert_eq!(fights[0].start_time, 80);
        // one tick too early
        let fights = detect(&players(vec![fire(79, 2), hit(200, 1, 2, 5.0)]));
        assert_eq!(fights[0].start_time, 200);
        // same tick as the hit
        let fights = detect(&players(vec![fire(200, 2), hit(200, 1, 2, 5.0)]));
        assert_eq!(fights[0].start_time, 200);
    }

    #[test]
    fn timeout_requires_gap_strictly_longer_than_window() {
        let fights = detect(&players(vec![hit(0, 1, 2, 5.0), hit(240, 1, 2, 5.0)]));
        assert_eq!(fights.len(), 1);
        assert_eq!(fights[0].end_time, 240);

        let fights = detect(&players(vec![hit(0, 1, 2, 5.0), hit(241, 1, 2, 5.0)]));
        assert_eq!(fights.len(), 2);
        assert_eq!(fights[0].end_time, 0);
        assert_eq!(fights[1].start_time, 241);
    }

    #[test]
    fn extreme_ticks_do_not_overflow() {
        let fights = detect(&players(vec![
            hit(Tick::MIN + 5, 1, 2, 5.0),
            fire(Tick::MAX, 1),
            hit(Tick::MAX, 1, 2, 5.0),
        ]));
        assert_eq!(fights.len(), 2);
        assert_eq!(fights[0].end_time, Tick::MIN + 5);
        assert_eq!(fights[1].start_time, Tick::MAX);
    }

    #[test]
    fn lookback_ignores_third_party_actions() {
        let fights = detect(&players(vec![fire(100, 3), hit(110, 1, 2, 5.0)]));
        assert_eq!(fights[0].start_time, 110);
    }

    #[test]
    fn self_damage_and_unknown_slots_are_ignored() {
        let fights = detect(&players(vec![hit(10, 1, 1, 5.0), hit(20, 1, 9, 5.0)]));
        assert!(fights.is_empty());
    }

    #[test]
    fn cause_rules_attribute_missing_items() {
        let mut events = players(vec![]);
        events.push(LogEvent::Damage {
            tick: 10,
            instigator: Some(2),
            target: Some(1),
            amount: 20.0,
            item: None,
            causer: Some("BP_Boomerang_C".into()),
            prev_health: Some(80.0),
        });
        let fights = detect(&events);
        assert_eq!(fights[0].damage[&2]["Boomerang"], 20.0);
        assert_eq!(fights[0].first_hit, FirstHit { target: 1, prev_health: Some(80.0) });
        // the target has an (empty) entry from the start
        assert!(fights[0].damage[&1].is_empty());
    }

    #[test]
    fn three_way_brawl_yields_overlapping_pairs() {
        let fights = detect(&players(vec![
            hit(10, 1, 2, 5.0),
            hit(12, 3, 2, 5.0),
            hit(14, 1, 3, 5.0),
            elim(20, 2),
        ]));
        assert_eq!(fights.len(), 3);
        let deaths: Vec<_> = fights.iter().filter(|f| f.end_reason == EndReason::Death).collect();
        assert_eq!(deaths.len(), 2);
        assert!(deaths.iter().all(|f| f.end_time == 20));
        let open_left = fights.iter().find(|f| f.pair == (1, 3)).unwrap();
        assert_eq!(open_left.end_reason, EndReason::Timeout);
    }

    #[test]
    fn fights_satisfy_structural_invariants() {
        let fights = detect(&players(vec![
            fire(5, 2),
            hit(10, 1, 2, 3.0),
            hit(30, 2, 1, 4.5),
            hit(40, 3, 1, 1.0),
            elim(50, 1),
            hit(900, 2, 3, 8.0),
        ]));
        assert!(!fights.is_empty());
        for f in &fights {
            assert_ne!(f.pair.0, f.pair.1);
            assert!(f.end_time >= f.start_time);
            assert!((f.damage_total - sum_entries(f)).abs() < 1e-9);
        }
    }

    #[test]
    fn detection_is_deterministic() {
        let events = players(vec![
            hit(10, 1, 2, 3.0),
            hit(11, 3, 2, 3.0),
            fire(100, 1),
            hit(130, 2, 3, 2.0),
            elim(140, 3),
        ]);
        assert_eq!(detect(&events), detect(&events));
    }
}
