/// Parses a match telemetry log into typed `LogEvent` values.
///
/// The log is a JSON document shaped like:
///
///   {
///     "Map": "Orbital", "GameMode": "FFA", "DurationSec": 312,
///     "winner": "Stonebraid", "winning team": 1,
///     "events": [
///       { "stamp": 0,   "name": "join",   "id": 3, "username": "Stonebraid" },
///       { "stamp": 40,  "name": "spawn",  "player": 3 },
///       { "stamp": 95,  "name": "fire",   "player": 3 },
///       { "stamp": 110, "name": "damage", "instigator": 3, "target": 5,
///         "damage": 25.0, "item": "Ripper", "prev_health": 100.0 },
///       ...
///     ]
///   }
///
/// Field usage per event name:
///   join / leave                     -> `id` (+ `username` on join)
///   spawn, equip, set_team, attacks  -> `player`
///   damage / elim                    -> `instigator`, `target`
///
/// Game builds emit slightly broken JSON (`5.` literals, trailing commas), so
/// the raw text is repaired before it reaches serde_json. A log that still
/// cannot be parsed becomes an empty `MatchLog`.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ephemeral per-login player slot, reused across sessions within a match.
pub type SlotId = u32;

/// Integer game-time unit used for every timestamp.
pub type Tick = i64;

/// Offensive actions that keep a fight alive and seed its lookback start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackKind {
    Fire,
    Throw,
    Swing,
    Stab,
    Burst,
}

impl AttackKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "fire"  => Some(Self::Fire),
            "throw" => Some(Self::Throw),
            "swing" => Some(Self::Swing),
            "stab"  => Some(Self::Stab),
            "burst" => Some(Self::Burst),
            _ => None,
        }
    }
}

/// Typed match events the reconstruction cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogEvent {
    Join {
        tick:     Tick,
        slot:     SlotId,
        username: String,
    },
    Leave {
        tick: Tick,
        slot: SlotId,
    },
    Spawn {
        tick: Tick,
        slot: SlotId,
    },
    Equip {
        tick: Tick,
        slot: SlotId,
        item: Option<String>,
    },
    Damage {
        tick:        Tick,
        instigator:  Option<SlotId>,
        target:      Option<SlotId>,
        amount:      f64,
        item:        Option<String>,
        causer:      Option<String>,
        prev_health: Option<f64>,
    },
    Elim {
        tick:       Tick,
        instigator: Option<SlotId>,
        target:     Option<SlotId>,
        item:       Option<String>,
    },
    Attack {
        tick: Tick,
        slot: SlotId,
        kind: AttackKind,
    },
    SetTeam {
        tick: Tick,
        slot: SlotId,
        team: i64,
    },
}

impl LogEvent {
    pub fn tick(&self) -> Tick {
        match self {
            Self::Join    { tick, .. } => *tick,
            Self::Leave   { tick, .. } => *tick,
            Self::Spawn   { tick, .. } => *tick,
            Self::Equip   { tick, .. } => *tick,
            Self::Damage  { tick, .. } => *tick,
            Self::Elim    { tick, .. } => *tick,
            Self::Attack  { tick, .. } => *tick,
            Self::SetTeam { tick, .. } => *tick,
        }
    }

    /// Damage, eliminations and attack actions drive the fight detector.
    pub fn is_combat(&self) -> bool {
        matches!(self, Self::Damage { .. } | Self::Elim { .. } | Self::Attack { .. })
    }
}

/// Match winner as logged: either a username or a raw slot id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Winner {
    Slot(SlotId),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchMeta {
    pub map:          String,
    pub mode:         String,
    pub duration_sec: f64,
    pub winner:       Option<Winner>,
    pub winning_team: Option<i64>,
}

impl Default for MatchMeta {
    fn default() -> Self {
        Self {
            map:          "Unknown".into(),
            mode:         "Unknown".into(),
            duration_sec: 0.0,
            winner:       None,
            winning_team: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchLog {
    pub meta:   MatchMeta,
    pub events: Vec<LogEvent>,
}

impl MatchLog {
    /// Greatest event tick; `None` for an empty log.
    pub fn last_tick(&self) -> Option<Tick> {
        self.events.iter().map(LogEvent::tick).max()
    }
}

// ---------------------------------------------------------------------------
// JSON repair
// ---------------------------------------------------------------------------

/// Fix the two defects game builds emit: `12.` number literals and trailing
/// commas before a closing bracket. String contents are left untouched.
pub fn repair_json(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    let next_significant = |from: usize| chars[from..].iter().find(|c| !c.is_whitespace()).copied();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '.' if i > 0
                && chars[i - 1].is_ascii_digit()
                && matches!(next_significant(i + 1), Some(',') | Some(']') | Some('}') | None) =>
            {
                out.push_str(".0");
            }
            ',' if matches!(next_significant(i + 1), Some(']') | Some('}')) => {}
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Largest magnitude a stamp may have and still be an exact integer tick.
const MAX_STAMP: f64 = 9_007_199_254_740_992.0; // 2^53

/// Stamps that are not finite or too large to be exact are rejected.
pub(crate) fn tick_from_f64(v: f64) -> Option<Tick> {
    (v.is_finite() && v.abs() <= MAX_STAMP).then(|| v.round() as Tick)
}

fn tick(obj: &Map<String, Value>, key: &str) -> Option<Tick> {
    number(obj, key).and_then(tick_from_f64)
}

/// Slot ids must be whole numbers in `SlotId` range.
pub(crate) fn slot_from_f64(v: f64) -> Option<SlotId> {
    (v >= 0.0 && v.fract() == 0.0 && v <= SlotId::MAX as f64).then(|| v as SlotId)
}

fn slot(obj: &Map<String, Value>, key: &str) -> Option<SlotId> {
    number(obj, key).and_then(slot_from_f64)
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert one raw event object. Returns `None` for unknown names or events
/// missing the fields their name requires.
pub fn parse_event(value: &Value) -> Option<LogEvent> {
    let obj = value.as_object()?;
    let t = tick(obj, "stamp")?;
    let name = obj.get("name")?.as_str()?;

    match name {
        "join" => {
            let id = slot(obj, "id")?;
            let username = text(obj, "username").unwrap_or_else(|| format!("Unknown_{}", id));
            Some(LogEvent::Join { tick: t, slot: id, username })
        }
        "leave" => Some(LogEvent::Leave { tick: t, slot: slot(obj, "id")? }),
        "spawn" => Some(LogEvent::Spawn { tick: t, slot: slot(obj, "player")? }),
        "equip" => Some(LogEvent::Equip {
            tick: t,
            slot: slot(obj, "player")?,
            item: text(obj, "item"),
        }),
        "damage" => Some(LogEvent::Damage {
            tick:        t,
            instigator:  slot(obj, "instigator"),
            target:      slot(obj, "target"),
            amount:      number(obj, "damage").unwrap_or(0.0),
            item:        text(obj, "item"),
            causer:      text(obj, "causer"),
            prev_health: number(obj, "prev_health"),
        }),
        "elim" => Some(LogEvent::Elim {
            tick:       t,
            instigator: slot(obj, "instigator"),
            target:     slot(obj, "target"),
            item:       text(obj, "item"),
        }),
        "set_team" => Some(LogEvent::SetTeam {
            tick: t,
            slot: slot(obj, "player")?,
            team: number(obj, "team")? as i64,
        }),
        other => {
            let kind = AttackKind::from_name(other)?;
            Some(LogEvent::Attack { tick: t, slot: slot(obj, "player")?, kind })
        }
    }
}

fn parse_meta(root: &Map<String, Value>) -> MatchMeta {
    let winner = match root.get("winner") {
        Some(Value::String(s)) if !s.is_empty() => Some(Winner::Name(s.clone())),
        Some(Value::Number(n)) => n.as_u64().map(|v| Winner::Slot(v as SlotId)),
        _ => None,
    };
    MatchMeta {
        map:          text(root, "Map").unwrap_or_else(|| "Unknown".into()),
        mode:         text(root, "GameMode").unwrap_or_else(|| "Unknown".into()),
        duration_sec: number(root, "DurationSec").unwrap_or(0.0),
        winner,
        winning_team: number(root, "winning team").map(|v| v as i64),
    }
}

/// Parse a whole match log. Never fails: unreadable input yields an empty log.
pub fn parse_match_json(raw: &str) -> MatchLog {
    let raw = raw.trim_start_matches('\u{feff}').trim();
    if raw.is_empty() {
        return MatchLog::default();
    }

    let root: Value = match serde_json::from_str(&repair_json(raw)) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Match log unparseable, treating as empty: {}", e);
            return MatchLog::default();
        }
    };
    let Some(root) = root.as_object() else {
        tracing::warn!("Match log root is not an object, treating as empty");
        return MatchLog::default();
    };

    let raw_events = root.get("events").and_then(Value::as_array);
    let total = raw_events.map(Vec::len).unwrap_or(0);
    let events: Vec<LogEvent> = raw_events
        .into_iter()
        .flatten()
        .filter_map(parse_event)
        .collect();

    tracing::debug!("Parsed {}/{} events", events.len(), total);
    MatchLog { meta: parse_meta(root), events }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "Map": "Orbital", "GameMode": "FFA", "DurationSec": 312.,
        "winner": "Stonebraid",
        "events": [
            { "stamp": 0, "name": "join", "id": 1, "username": "Stonebraid" },
            { "stamp": 100, "name": "fire", "player": 1 },
            { "stamp": 110, "name": "damage", "instigator": 1, "target": 2, "damage": 5.,
              "item": "Ripper", "prev_health": 100 },
            { "stamp": 120, "name": "emote", "player": 1 },
        ],
    }"#;

    #[test]
    fn repairs_dangling_decimals_and_trailing_commas() {
        assert_eq!(repair_json("[1., 2.,]"), "[1.0, 2.0]");
        assert_eq!(repair_json(r#"{"a": 3.}"#), r#"{"a": 3.0}"#);
        // untouched inside strings
        assert_eq!(repair_json(r#"{"s": "5., ]"}"#), r#"{"s": "5., ]"}"#);
    }

    #[test]
    fn parses_sample_log() {
        let log = parse_match_json(SAMPLE);
        assert_eq!(log.meta.map, "Orbital");
        assert_eq!(log.meta.duration_sec, 312.0);
        assert_eq!(log.meta.winner, Some(Winner::Name("Stonebraid".into())));
        // unknown "emote" is skipped
        assert_eq!(log.events.len(), 3);
        assert_eq!(log.last_tick(), Some(110));
        match &log.events[2] {
            LogEvent::Damage { instigator, target, amount, item, prev_health, .. } => {
                assert_eq!(*instigator, Some(1));
                assert_eq!(*target, Some(2));
                assert_eq!(*amount, 5.0);
                assert_eq!(item.as_deref(), Some("Ripper"));
                assert_eq!(*prev_health, Some(100.0));
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn parses_attack_kinds() {
        let e = parse_event(&json!({ "stamp": 7, "name": "stab", "player": 4 })).unwrap();
        assert_eq!(e, LogEvent::Attack { tick: 7, slot: 4, kind: AttackKind::Stab });
        assert!(e.is_combat());
    }

    #[test]
    fn join_without_username_gets_placeholder() {
        let e = parse_event(&json!({ "stamp": 0, "name": "join", "id": 9 })).unwrap();
        assert_eq!(e, LogEvent::Join { tick: 0, slot: 9, username: "Unknown_9".into() });
    }

    #[test]
    fn event_without_stamp_is_dropped() {
        assert!(parse_event(&json!({ "name": "spawn", "player": 1 })).is_none());
    }

    #[test]
    fn out_of_range_stamps_and_ids_are_dropped() {
        assert!(parse_event(&json!({ "stamp": 1e30, "name": "spawn", "player": 1 })).is_none());
        assert!(parse_event(&json!({ "stamp": -1e30, "name": "fire", "player": 1 })).is_none());
        assert!(parse_event(&json!({ "stamp": 5, "name": "spawn", "player": 1.5 })).is_none());
        assert!(parse_event(&json!({ "stamp": 5, "name": "join", "id": -2 })).is_none());
        assert_eq!(
            parse_event(&json!({ "stamp": 9007199254740992.0_f64, "name": "spawn", "player": 3 })),
            Some(LogEvent::Spawn { tick: 9_007_199_254_740_992, slot: 3 })
        );
    }

    #[test]
    fn garbage_degrades_to_empty_log() {
        assert_eq!(parse_match_json("not json at all"), MatchLog::default());
        assert_eq!(parse_match_json(""), MatchLog::default());
        assert_eq!(parse_match_json("\u{feff}[1, 2]"), MatchLog::default());
    }
}
