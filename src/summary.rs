/// Per-match summary handed to downstream studies alongside the fights:
/// player outcomes, item usage and client performance aggregates.
use crate::{
    config::AppConfig,
    finalize::Fight,
    parser::{LogEvent, MatchLog, MatchMeta, Winner},
    state::MatchState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub kills:    u32,
    pub deaths:   u32,
    /// Seconds connected across all of the player's sessions.
    pub playtime: f64,
    pub won:      bool,
    pub team:     Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub swaps:       u32,
    pub first_picks: u32,
    /// Eliminations where this item landed the final blow.
    pub kills_final: u32,
    /// Eliminations where the killer was holding this item.
    pub kills_held:  u32,
    /// Eliminations where the victim was holding this item.
    pub deaths_held: u32,
    pub suicides:    u32,
    /// Seconds this item was held, summed over every equip.
    pub time_held:   f64,
}

// ---------------------------------------------------------------------------
// Performance samples
// ---------------------------------------------------------------------------

/// One frame-timing sample from a player's client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PerformanceSample {
    #[serde(rename = "GPU Bound", default)]
    pub gpu_bound:      Option<f64>,
    #[serde(rename = "GT Bound", default)]
    pub gt_bound:       Option<f64>,
    #[serde(rename = "NTT Bound", default)]
    pub ntt_bound:      Option<f64>,
    #[serde(rename = "Packet Latency", default)]
    pub packet_latency: Option<f64>,
    #[serde(rename = "Frame Avg", default)]
    pub frame_avg:      Option<f64>,
}

impl PerformanceSample {
    pub fn read_csv<R: Read>(reader: R) -> Result<Vec<Self>, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        rdr.headers()?;

        let mut skipped = 0usize;
        let mut samples = Vec::new();
        for row in rdr.deserialize::<Self>() {
            match row {
                Ok(sample) => samples.push(sample),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("Performance table: skipped {} malformed rows", skipped);
        }
        Ok(samples)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_frames:         usize,
    pub gpu_bound_frames:     u64,
    pub gt_bound_frames:      u64,
    pub nettick_bound_frames: u64,
    pub avg_latency:          f64,
    pub avg_fps:              f64,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl PerformanceSummary {
    pub fn from_samples(samples: &[PerformanceSample]) -> Self {
        let count = |f: fn(&PerformanceSample) -> Option<f64>| {
            samples.iter().filter_map(f).sum::<f64>().max(0.0) as u64
        };
        let avg_frame_ms = mean(samples.iter().filter_map(|s| s.frame_avg)).unwrap_or(0.0);
        Self {
            total_frames:         samples.len(),
            gpu_bound_frames:     count(|s| s.gpu_bound),
            gt_bound_frames:      count(|s| s.gt_bound),
            nettick_bound_frames: count(|s| s.ntt_bound),
            avg_latency:          mean(samples.iter().filter_map(|s| s.packet_latency)).unwrap_or(0.0),
            avg_fps:              if avg_frame_ms > 0.0 { 1000.0 / avg_frame_ms } else { 0.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// MatchSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id:        String,
    pub meta:            MatchMeta,
    pub players:         BTreeMap<String, PlayerSummary>,
    pub items:           BTreeMap<String, ItemSummary>,
    pub performance:     BTreeMap<String, PerformanceSummary>,
    pub fights:          usize,
    pub decisive_fights: usize,
}

pub fn summarize(
    match_id:    &str,
    log:         &MatchLog,
    state:       &MatchState,
    fights:      &[Fight],
    performance: &BTreeMap<String, Vec<PerformanceSample>>,
    cfg:         &AppConfig,
) -> MatchSummary {
    let identity = &state.identity;
    let match_end = state.match_end();

    let mut ordered: Vec<&LogEvent> = log.events.iter().collect();
    ordered.sort_by_key(|e| e.tick());

    // last team assignment per username
    let mut teams: BTreeMap<String, i64> = BTreeMap::new();
    for event in &ordered {
        if let LogEvent::SetTeam { tick, slot, team } = event {
            teams.insert(identity.resolve(*slot, *tick), *team);
        }
    }

    let winner_name = match &log.meta.winner {
        Some(Winner::Name(name)) => Some(name.clone()),
        Some(Winner::Slot(slot)) => Some(identity.resolve(*slot, match_end)),
        None => None,
    };

    let mut players: BTreeMap<String, PlayerSummary> = BTreeMap::new();
    for (username, slots) in identity.usernames() {
        let team = teams.get(username).copied();
        let won = match log.meta.winning_team {
            Some(winning) => team == Some(winning),
            None => winner_name.as_deref() == Some(username),
        };
        let playtime_ticks: i64 = slots
            .iter()
            .flat_map(|&slot| identity.intervals(slot))
            .filter(|iv| iv.username == username)
            .map(|iv| (iv.end.min(match_end) - iv.start).max(0))
            .sum();
        players.insert(
            username.to_owned(),
            PlayerSummary { playtime: cfg.seconds(playtime_ticks), won, team, ..Default::default() },
        );
    }

    let mut items: BTreeMap<String, ItemSummary> = BTreeMap::new();
    let mut picked: HashSet<String> = HashSet::new();

    for event in &ordered {
        match event {
            LogEvent::Equip { tick, slot, item } => {
                let item = item.clone().unwrap_or_else(|| cfg.default_item.clone());
                let user = identity.resolve(*slot, *tick);
                let entry = items.entry(item).or_default();
                entry.swaps += 1;
                if picked.insert(user) {
                    entry.first_picks += 1;
                }
            }
            LogEvent::Elim { tick, instigator: Some(killer), target: Some(victim), item } => {
                let final_item = item.clone().unwrap_or_else(|| cfg.unknown_item.clone());
                if killer == victim {
                    items.entry(final_item).or_default().suicides += 1;
                } else {
                    items.entry(final_item).or_default().kills_final += 1;
                    let held_k = state.loadout.current_item(identity, *killer, *tick).to_owned();
                    items.entry(held_k).or_default().kills_held += 1;
                    let held_d = state.loadout.current_item(identity, *victim, *tick).to_owned();
                    items.entry(held_d).or_default().deaths_held += 1;
                    if let Some(p) = players.get_mut(&identity.resolve(*killer, *tick)) {
                        p.kills += 1;
                    }
                }
                if let Some(p) = players.get_mut(&identity.resolve(*victim, *tick)) {
                    p.deaths += 1;
                }
            }
            LogEvent::Elim { tick, target: Some(victim), .. } => {
                if let Some(p) = players.get_mut(&identity.resolve(*victim, *tick)) {
                    p.deaths += 1;
                }
            }
            _ => {}
        }
    }

    for (entry, ticks) in state.loadout.held_spans(identity) {
        items.entry(entry.item.clone()).or_default().time_held += cfg.seconds(ticks);
    }

    let performance = performance
        .iter()
        .filter(|(_, samples)| !samples.is_empty())
        .map(|(user, samples)| (user.clone(), PerformanceSummary::from_samples(samples)))
        .collect();

    MatchSummary {
        match_id:        match_id.to_owned(),
        meta:            log.meta.clone(),
        players,
        items,
        performance,
        fights:          fights.len(),
        decisive_fights: fights.iter().filter(|f| f.winner.is_some()).count(),
    }
}
