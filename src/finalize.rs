/// Fight finalizer. Turns the detector's closed fights into sealed records
/// with resolved identities and start-of-fight context.
///
/// Fights are finalized strictly in ascending `end_time`: a participant's
/// idle time depends on their most recent fight that was already finalized,
/// so this pass cannot be reordered or split.
use crate::{
    config::AppConfig,
    engine::{ClosedFight, EndReason},
    parser::{SlotId, Tick},
    snapshot::{distance, Vec3},
    state::MatchState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDetail {
    pub slot:               SlotId,
    pub username:           String,
    /// Item in hand at fight start.
    pub held_item:          String,
    /// item -> damage dealt in this fight; `{held_item: 0}` when nothing landed
    pub items_used:         BTreeMap<String, f64>,
    pub total_damage_dealt: f64,
    pub start_health:       f64,
    pub start_pos:          Vec3,
    /// Seconds since this player's previous fight, spawn or login.
    pub idle_pre:           f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fight {
    pub id:           String,
    pub start_time:   Tick,
    pub end_time:     Tick,
    /// Seconds between start and end.
    pub duration:     f64,
    pub end_reason:   EndReason,
    pub winner:       Option<String>,
    pub damage_total: f64,
    pub start_dist:   f64,
    /// Ordered by slot id.
    pub participants: [ParticipantDetail; 2],
}

impl Fight {
    pub fn participant(&self, username: &str) -> Option<&ParticipantDetail> {
        self.participants.iter().find(|p| p.username == username)
    }

    pub fn involves(&self, username: &str) -> bool {
        self.participant(username).is_some()
    }
}

pub struct Finalizer<'a> {
    state:    &'a MatchState,
    cfg:      &'a AppConfig,
    /// username -> end ticks of their finalized fights, ascending
    ends:     HashMap<String, Vec<Tick>>,
    finished: Vec<Fight>,
}

impl<'a> Finalizer<'a> {
    pub fn new(state: &'a MatchState, cfg: &'a AppConfig) -> Self {
        Self { state, cfg, ends: HashMap::new(), finished: Vec::new() }
    }

    /// Finalize every fight, returning them in chronological order of end.
    pub fn run(mut self, mut closed: Vec<ClosedFight>) -> Vec<Fight> {
        // stable: equal ends keep the order the detector closed them in
        closed.sort_by_key(|f| (f.end_time, f.start_time));
        for fight in closed {
            let sealed = self.finalize(fight);
            for p in &sealed.participants {
                self.ends.entry(p.username.clone()).or_default().push(sealed.end_time);
            }
            self.finished.push(sealed);
        }
        self.finished
    }

    fn finalize(&self, fight: ClosedFight) -> Fight {
        let start = fight.start_time;
        let [a, b] = [fight.pair.0, fight.pair.1].map(|slot| self.participant(&fight, slot));
        let mut participants = [a.0, b.0];
        let positions = [a.1, b.1];

        // the opening hit knows the target's health better than a nearby frame
        if let Some(prev) = fight.first_hit.prev_health {
            if let Some(p) = participants.iter_mut().find(|p| p.slot == fight.first_hit.target) {
                p.start_health = prev;
            }
        }

        let start_dist = match positions {
            [Some(pa), Some(pb)] => distance(&pa, &pb),
            _ => 0.0,
        };

        let winner = fight
            .winner
            .map(|slot| self.state.identity.resolve(slot, fight.end_time));

        let sealed = Fight {
            id:           fight.id,
            start_time:   start,
            end_time:     fight.end_time,
            duration:     self.cfg.seconds(fight.end_time - start),
            end_reason:   fight.end_reason,
            winner,
            damage_total: fight.damage_total,
            start_dist,
            participants,
        };
        tracing::debug!(
            "Finalized {} {} vs {} ({:?}, winner {:?})",
            sealed.id,
            sealed.participants[0].username,
            sealed.participants[1].username,
            sealed.end_reason,
            sealed.winner
        );
        sealed
    }

    /// Detail for one side plus its raw position, if a frame was found.
    fn participant(&self, fight: &ClosedFight, slot: SlotId) -> (ParticipantDetail, Option<Vec3>) {
        let start = fight.start_time;
        let identity = &self.state.identity;
        let username = identity.resolve(slot, start);
        let session_start = identity.session_start(slot, start);

        let idle_pre = self.idle_seconds(&username, slot, start, session_start);

        let held_item = self
            .state
            .loadout
            .current_item(identity, slot, start)
            .to_owned();
        let mut items_used = fight.damage.get(&slot).cloned().unwrap_or_default();
        if items_used.is_empty() {
            items_used.insert(held_item.clone(), 0.0);
        }
        let total_damage_dealt = items_used.values().sum();

        let frame = self
            .state
            .snapshots
            .nearest(slot, start, self.cfg.snapshot_tolerance_ticks);
        let start_health = frame
            .and_then(|f| f.health)
            .unwrap_or(self.cfg.default_health);
        let position = frame.and_then(|f| f.position);

        let detail = ParticipantDetail {
            slot,
            username,
            held_item,
            items_used,
            total_damage_dealt,
            start_health,
            start_pos: position.unwrap_or([0.0; 3]),
            idle_pre,
        };
        (detail, position)
    }

    /// Later of the player's last finished fight ending before `start` and
    /// their last spawn this session; the session start when neither exists.
    fn idle_seconds(&self, username: &str, slot: SlotId, start: Tick, session_start: Tick) -> f64 {
        let last_fight_end = self.ends.get(username).and_then(|ends| {
            let upto = ends.partition_point(|&e| e < start);
            upto.checked_sub(1).map(|i| ends[i])
        });
        let last_spawn = self.state.spawns.last_spawn(slot, start, session_start);

        let reference = last_fight_end.max(last_spawn).unwrap_or(session_start);
        self.cfg.seconds(start - reference)
    }
}

pub fn finalize_fights(closed: Vec<ClosedFight>, state: &MatchState, cfg: &AppConfig) -> Vec<Fight> {
    Finalizer::new(state, cfg).run(closed)
}
