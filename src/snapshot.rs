/// Periodic per-slot state samples (health, position, velocity, roll).
///
/// Frames are sparse: there is no guarantee a frame exists at any given tick,
/// so lookups search for the nearest frame within a tolerance.
///
/// CSV layout (`PlayerUpdate_<id>.csv`, headers may carry stray spaces):
///   PlayerId, Stamp, Health, Location.X, Location.Y, Location.Z,
///   Velocity.X, Velocity.Y, Velocity.Z, Rotation.Roll
use crate::parser::{slot_from_f64, tick_from_f64, SlotId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

pub type Vec3 = [f64; 3];

pub fn distance(a: &Vec3, b: &Vec3) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub slot:     SlotId,
    pub tick:     Tick,
    pub health:   Option<f64>,
    pub position: Option<Vec3>,
    pub velocity: Option<Vec3>,
    pub roll:     Option<f64>,
}

/// One CSV row as written by the game. Every column but the key is optional.
#[derive(Debug, Deserialize)]
struct SnapshotRow {
    #[serde(rename = "PlayerId")]
    player_id: f64,
    #[serde(rename = "Stamp")]
    stamp:     f64,
    #[serde(rename = "Health", default)]
    health:    Option<f64>,
    #[serde(rename = "Location.X", default)]
    loc_x:     Option<f64>,
    #[serde(rename = "Location.Y", default)]
    loc_y:     Option<f64>,
    #[serde(rename = "Location.Z", default)]
    loc_z:     Option<f64>,
    #[serde(rename = "Velocity.X", default)]
    vel_x:     Option<f64>,
    #[serde(rename = "Velocity.Y", default)]
    vel_y:     Option<f64>,
    #[serde(rename = "Velocity.Z", default)]
    vel_z:     Option<f64>,
    #[serde(rename = "Rotation.Roll", default)]
    roll:      Option<f64>,
}

fn vec3(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Option<Vec3> {
    Some([x?, y?, z?])
}

impl TryFrom<SnapshotRow> for SnapshotFrame {
    type Error = ();

    /// Rows whose key is not a whole non-negative slot id or a usable stamp
    /// are rejected.
    fn try_from(row: SnapshotRow) -> Result<Self, ()> {
        Ok(Self {
            slot:     slot_from_f64(row.player_id).ok_or(())?,
            tick:     tick_from_f64(row.stamp).ok_or(())?,
            health:   row.health,
            position: vec3(row.loc_x, row.loc_y, row.loc_z),
            velocity: vec3(row.vel_x, row.vel_y, row.vel_z),
            roll:     row.roll,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotTable {
    by_slot: BTreeMap<SlotId, Vec<SnapshotFrame>>,
}

impl SnapshotTable {
    pub fn from_frames(frames: impl IntoIterator<Item = SnapshotFrame>) -> Self {
        let mut by_slot: BTreeMap<SlotId, Vec<SnapshotFrame>> = BTreeMap::new();
        for frame in frames {
            by_slot.entry(frame.slot).or_default().push(frame);
        }
        for frames in by_slot.values_mut() {
            frames.sort_by_key(|f| f.tick);
        }
        Self { by_slot }
    }

    /// Read the snapshot CSV. Rows that fail to deserialize or carry an
    /// unusable key are skipped and counted; a broken header is an error.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        rdr.headers()?;

        let mut skipped = 0usize;
        let mut frames = Vec::new();
        for row in rdr.deserialize::<SnapshotRow>() {
            match row.map(SnapshotFrame::try_from) {
                Ok(Ok(frame)) => frames.push(frame),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("Snapshot table: skipped {} malformed rows", skipped);
        }
        Ok(Self::from_frames(frames))
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.by_slot.keys().copied()
    }

    pub fn frames(&self, slot: SlotId) -> &[SnapshotFrame] {
        self.by_slot.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn max_tick(&self) -> Option<Tick> {
        self.by_slot.values().filter_map(|f| f.last()).map(|f| f.tick).max()
    }

    /// Frame for `slot` closest to `tick`, at most `tolerance` ticks away.
    /// Ties go to the earlier frame.
    pub fn nearest(&self, slot: SlotId, tick: Tick, tolerance: Tick) -> Option<&SnapshotFrame> {
        let frames = self.by_slot.get(&slot)?;
        let split = frames.partition_point(|f| f.tick < tick);

        let before = split.checked_sub(1).and_then(|i| frames.get(i));
        let after  = frames.get(split);

        let best = match (before, after) {
            (Some(b), Some(a)) if (a.tick - tick) < (tick - b.tick) => a,
            (Some(b), _) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        ((best.tick - tick).abs() <= tolerance).then_some(best)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "PlayerId, Stamp, Health, Location.X, Location.Y, Location.Z, Velocity.X, Velocity.Y, Velocity.Z, Rotation.Roll
1, 0, 100, 0, 0, 0, 0, 0, 0, 0
1, 60, 80.5, 3, 4, 0, 1, 0, 0, 12
2, 60, 100, 10, 0, 0, 0, 0, 0, 0
2, oops, 100, 10, 0, 0, 0, 0, 0, 0
";

    #[test]
    fn parses_csv_with_padded_headers() {
        let table = SnapshotTable::from_csv(CSV.as_bytes()).unwrap();
        assert_eq!(table.slots().collect::<Vec<_>>(), vec![1, 2]);
        // malformed row dropped
        assert_eq!(table.frames(2).len(), 1);
        let f = &table.frames(1)[1];
        assert_eq!(f.health, Some(80.5));
        assert_eq!(f.position, Some([3.0, 4.0, 0.0]));
        assert_eq!(f.roll, Some(12.0));
        assert_eq!(table.max_tick(), Some(60));
    }

    #[test]
    fn nearest_respects_tolerance() {
        let table = SnapshotTable::from_csv(CSV.as_bytes()).unwrap();
        assert_eq!(table.nearest(1, 50, 30).map(|f| f.tick), Some(60));
        assert_eq!(table.nearest(1, 20, 30).map(|f| f.tick), Some(0));
        // equidistant: earlier frame wins
        assert_eq!(table.nearest(1, 30, 30).map(|f| f.tick), Some(0));
        assert!(table.nearest(1, 200, 30).is_none());
        assert!(table.nearest(9, 0, 30).is_none());
    }

    #[test]
    fn missing_location_columns_leave_position_empty() {
        let csv = "PlayerId,Stamp,Health\n3,10,55\n";
        let table = SnapshotTable::from_csv(csv.as_bytes()).unwrap();
        let f = table.nearest(3, 10, 0).unwrap();
        assert_eq!(f.health, Some(55.0));
        assert!(f.position.is_none());
    }

    #[test]
    fn rows_with_unusable_keys_are_skipped() {
        let csv = "PlayerId,Stamp,Health\n-1,0,100\n2.5,0,100\nNaN,0,100\n4,1e30,100\n4,10,90\n";
        let table = SnapshotTable::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.slots().collect::<Vec<_>>(), vec![4]);
        assert_eq!(table.frames(4).len(), 1);
        assert!(table.frames(0).is_empty());
    }

    #[test]
    fn euclidean_distance() {
        assert_eq!(distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]), 5.0);
    }
}
