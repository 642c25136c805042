/// SQLite fight ledger.
///
/// Uses `rusqlite` with the `bundled` feature so SQLite is compiled in.
///
/// Writes go through a dedicated `std::thread` that owns the connection and
/// receives commands over a bounded sync channel; callers hold a `DbWriter`
/// handle that is Clone + Send + Sync and can be shared by every worker.
/// Re-inserting a match replaces its previous rows, so reprocessing a data
/// directory leaves the ledger in the same state.
///
/// `load_fights` opens its own short-lived read-only connection.
use crate::{
    engine::EndReason,
    finalize::{Fight, ParticipantDetail},
    parser::MatchMeta,
};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Commands sent to the writer thread
// ---------------------------------------------------------------------------

pub enum DbCommand {
    InsertMatch {
        reply:    oneshot::Sender<Result<usize>>,
        match_id: String,
        meta:     MatchMeta,
        fights:   Vec<Fight>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// DbWriter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DbWriter {
    tx: std::sync::mpsc::SyncSender<DbCommand>,
}

impl DbWriter {
    /// Store a match and its fights, replacing any earlier copy. Returns the
    /// number of fight rows written.
    pub async fn insert_match(&self, match_id: String, meta: MatchMeta, fights: Vec<Fight>) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DbCommand::InsertMatch { reply: reply_tx, match_id, meta, fights })
            .map_err(|_| anyhow::anyhow!("DB writer channel closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("DB reply channel closed"))?
    }

    /// Stop the writer thread once queued commands are drained.
    pub fn shutdown(&self) {
        let _ = self.tx.send(DbCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// spawn_db_writer
// ---------------------------------------------------------------------------

/// Open (or create) the ledger at `db_path`, apply the schema and spawn the
/// writer thread.
pub fn spawn_db_writer(db_path: &Path) -> Result<DbWriter> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    apply_schema(&conn)?;

    let (tx, rx) = std::sync::mpsc::sync_channel::<DbCommand>(64);

    std::thread::spawn(move || db_writer_loop(rx, conn));

    tracing::info!("SQLite writer started at {:?}", db_path);
    Ok(DbWriter { tx })
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous   = NORMAL;

        CREATE TABLE IF NOT EXISTS matches (
            id           TEXT    PRIMARY KEY,
            map          TEXT    NOT NULL,
            mode         TEXT    NOT NULL,
            duration_sec REAL    NOT NULL,
            fight_count  INTEGER NOT NULL,
            processed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fights (
            id           TEXT    PRIMARY KEY,
            match_id     TEXT    NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
            start_time   INTEGER NOT NULL,
            end_time     INTEGER NOT NULL,
            duration     REAL    NOT NULL,
            end_reason   TEXT    NOT NULL,
            winner       TEXT,
            damage_total REAL    NOT NULL,
            start_dist   REAL    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fight_participants (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            fight_id           TEXT    NOT NULL REFERENCES fights(id) ON DELETE CASCADE,
            slot               INTEGER NOT NULL,
            username           TEXT    NOT NULL,
            held_item          TEXT    NOT NULL,
            total_damage_dealt REAL    NOT NULL,
            start_health       REAL    NOT NULL,
            start_x            REAL    NOT NULL,
            start_y            REAL    NOT NULL,
            start_z            REAL    NOT NULL,
            idle_pre           REAL    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participant_items (
            participant_id INTEGER NOT NULL REFERENCES fight_participants(id) ON DELETE CASCADE,
            item           TEXT    NOT NULL,
            damage         REAL    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_fights_match       ON fights(match_id);
        CREATE INDEX IF NOT EXISTS idx_participants_fight ON fight_participants(fight_id);
        CREATE INDEX IF NOT EXISTS idx_participants_user  ON fight_participants(username);
        CREATE INDEX IF NOT EXISTS idx_items_participant  ON participant_items(participant_id);
    ")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Writer loop (runs on its own std::thread)
// ---------------------------------------------------------------------------

fn db_writer_loop(rx: std::sync::mpsc::Receiver<DbCommand>, mut conn: Connection) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DbCommand::InsertMatch { reply, match_id, meta, fights } => {
                let result = write_match(&mut conn, &match_id, &meta, &fights);
                if let Err(e) = &result {
                    tracing::warn!("DB insert_match {} error: {}", match_id, e);
                }
                let _ = reply.send(result);
            }

            DbCommand::Shutdown => break,
        }
    }
    tracing::debug!("SQLite writer stopped");
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn write_match(conn: &mut Connection, match_id: &str, meta: &MatchMeta, fights: &[Fight]) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM matches WHERE id = ?1", params![match_id])?;
    tx.execute(
        "INSERT INTO matches (id, map, mode, duration_sec, fight_count, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![match_id, meta.map, meta.mode, meta.duration_sec, fights.len() as i64, unix_now()],
    )?;

    for fight in fights {
        tx.execute(
            "INSERT INTO fights (id, match_id, start_time, end_time, duration, end_reason, winner, \
                                 damage_total, start_dist) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                fight.id,
                match_id,
                fight.start_time,
                fight.end_time,
                fight.duration,
                end_reason_label(fight.end_reason),
                fight.winner,
                fight.damage_total,
                fight.start_dist,
            ],
        )?;

        for p in &fight.participants {
            tx.execute(
                "INSERT INTO fight_participants (fight_id, slot, username, held_item, total_damage_dealt, \
                                                 start_health, start_x, start_y, start_z, idle_pre) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    fight.id,
                    p.slot,
                    p.username,
                    p.held_item,
                    p.total_damage_dealt,
                    p.start_health,
                    p.start_pos[0],
                    p.start_pos[1],
                    p.start_pos[2],
                    p.idle_pre,
                ],
            )?;
            let participant_id = tx.last_insert_rowid();
            for (item, damage) in &p.items_used {
                tx.execute(
                    "INSERT INTO participant_items (participant_id, item, damage) VALUES (?1, ?2, ?3)",
                    params![participant_id, item, damage],
                )?;
            }
        }
    }

    tx.commit()?;
    Ok(fights.len())
}

fn end_reason_label(reason: EndReason) -> &'static str {
    match reason {
        EndReason::Death   => "death",
        EndReason::Timeout => "timeout",
    }
}

fn parse_end_reason(label: &str) -> Option<EndReason> {
    match label {
        "death"   => Some(EndReason::Death),
        "timeout" => Some(EndReason::Timeout),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Every stored fight of `match_id`, in the order they were finalized.
/// Rows that no longer form a two-participant fight are skipped.
pub fn load_fights(db_path: &Path, match_id: &str) -> Result<Vec<Fight>> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open ledger {}", db_path.display()))?;

    let mut fight_stmt = conn.prepare(
        "SELECT id, start_time, end_time, duration, end_reason, winner, damage_total, start_dist \
         FROM fights WHERE match_id = ?1 ORDER BY rowid",
    )?;
    let mut part_stmt = conn.prepare(
        "SELECT id, slot, username, held_item, total_damage_dealt, start_health, \
                start_x, start_y, start_z, idle_pre \
         FROM fight_participants WHERE fight_id = ?1 ORDER BY slot",
    )?;
    let mut item_stmt = conn.prepare(
        "SELECT item, damage FROM participant_items WHERE participant_id = ?1",
    )?;

    let rows = fight_stmt
        .query_map(params![match_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut fights = Vec::with_capacity(rows.len());
    for (id, start_time, end_time, duration, reason, winner, damage_total, start_dist) in rows {
        let Some(end_reason) = parse_end_reason(&reason) else {
            tracing::warn!("Fight {} has unknown end reason {:?}", id, reason);
            continue;
        };

        let heads = part_stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    ParticipantDetail {
                        slot:               row.get(1)?,
                        username:           row.get(2)?,
                        held_item:          row.get(3)?,
                        items_used:         BTreeMap::new(),
                        total_damage_dealt: row.get(4)?,
                        start_health:       row.get(5)?,
                        start_pos:          [row.get(6)?, row.get(7)?, row.get(8)?],
                        idle_pre:           row.get(9)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut participants = Vec::with_capacity(2);
        for (participant_id, mut detail) in heads {
            detail.items_used = item_stmt
                .query_map(params![participant_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<BTreeMap<String, f64>, _>>()?;
            participants.push(detail);
        }

        let Ok(participants) = <[ParticipantDetail; 2]>::try_from(participants) else {
            tracing::warn!("Fight {} does not have exactly two participants", id);
            continue;
        };

        fights.push(Fight {
            id,
            start_time,
            end_time,
            duration,
            end_reason,
            winner,
            damage_total,
            start_dist,
            participants,
        });
    }
    Ok(fights)
}
