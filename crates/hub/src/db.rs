use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::warn;

use crate::phase::Phase;
use crate::sizer::Dose;
use crate::zone::{IrrigationCommand, ZoneSnapshot};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// How a journaled command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Executed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }
}

type ZoneStateRow = (
    String,
    String,
    Option<f64>,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
    i64,
    i64,
    i64,
);

fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/cropsteer/cropsteer.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zone state
    // ----------------------------

    pub async fn save_zone_state(&self, s: &ZoneSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zone_state (
              zone_id, phase, peak_vwc, last_irrigation_at, p1_entered_at,
              shots_p0, shots_p1, shots_p2, shots_p3, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              phase=excluded.phase,
              peak_vwc=excluded.peak_vwc,
              last_irrigation_at=excluded.last_irrigation_at,
              p1_entered_at=excluded.p1_entered_at,
              shots_p0=excluded.shots_p0,
              shots_p1=excluded.shots_p1,
              shots_p2=excluded.shots_p2,
              shots_p3=excluded.shots_p3,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&s.zone_id)
        .bind(s.phase.to_string())
        .bind(s.peak_vwc.map(f64::from))
        .bind(s.last_irrigation_at.map(|t| t.unix_timestamp()))
        .bind(s.p1_entered_at.map(|t| t.unix_timestamp()))
        .bind(s.shots[0] as i64)
        .bind(s.shots[1] as i64)
        .bind(s.shots[2] as i64)
        .bind(s.shots[3] as i64)
        .bind(s.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("save_zone_state failed for zone '{}'", s.zone_id))?;
        Ok(())
    }

    pub async fn load_zone_states(&self) -> Result<Vec<ZoneSnapshot>> {
        let rows: Vec<ZoneStateRow> = sqlx::query_as(
            r#"
            SELECT zone_id, phase, peak_vwc, last_irrigation_at, p1_entered_at,
                   shots_p0, shots_p1, shots_p2, shots_p3, updated_at
            FROM zone_state
            ORDER BY zone_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zone_states failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for (zone_id, phase, peak, last_irr, p1_at, s0, s1, s2, s3, updated) in rows {
            let phase = match Phase::from_str(&phase) {
                Ok(p) => p,
                Err(e) => {
                    warn!(zone = %zone_id, "skipping persisted state: {e}");
                    continue;
                }
            };
            let Some(updated_at) = from_unix(updated) else {
                warn!(zone = %zone_id, updated, "skipping persisted state: bad timestamp");
                continue;
            };
            out.push(ZoneSnapshot {
                zone_id,
                phase,
                peak_vwc: peak.map(|v| v as f32),
                last_irrigation_at: last_irr.and_then(from_unix),
                p1_entered_at: p1_at.and_then(from_unix),
                shots: [s0, s1, s2, s3].map(|n| n.clamp(0, u32::MAX as i64) as u32),
                updated_at,
            });
        }
        Ok(out)
    }

    // ----------------------------
    // Command journal
    // ----------------------------

    pub async fn insert_command(&self, cmd: &IrrigationCommand) -> Result<()> {
        let duration_sec = match cmd.dose {
            Dose::Duration { seconds, .. } => Some(seconds as i64),
            Dose::Volume { .. } => None,
        };
        sqlx::query(
            r#"
            INSERT INTO irrigation_commands (
              command_id, zone_id, issued_at, phase, trigger_kind, liters, duration_sec
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cmd.command_id as i64)
        .bind(&cmd.zone_id)
        .bind(cmd.issued_at.unix_timestamp())
        .bind(cmd.phase.to_string())
        .bind(cmd.trigger.as_str())
        .bind(cmd.dose.liters() as f64)
        .bind(duration_sec)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_command failed for #{}", cmd.command_id))?;
        Ok(())
    }

    /// Mark a pending command resolved.  Returns `false` if it was unknown
    /// or already resolved.
    pub async fn resolve_command(
        &self,
        command_id: u64,
        status: CommandStatus,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_commands
            SET status = ?, resolved_at = ?
            WHERE command_id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(at.unix_timestamp())
        .bind(command_id as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("resolve_command failed for #{command_id}"))?;
        Ok(res.rows_affected() > 0)
    }

    /// Mark every still-pending command as timed out.  Run once at startup:
    /// in-flight commands are not persisted, so nothing can resolve them.
    /// Returns `(command_id, zone_id)` for each row touched, ordered by id.
    pub async fn expire_pending(&self, at: OffsetDateTime) -> Result<Vec<(u64, String)>> {
        let mut rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE irrigation_commands
            SET status = 'timeout', resolved_at = ?
            WHERE status = 'pending'
            RETURNING command_id, zone_id
            "#,
        )
        .bind(at.unix_timestamp())
        .fetch_all(&self.pool)
        .await
        .context("expire_pending failed")?;

        rows.sort_by_key(|(id, _)| *id);
        Ok(rows
            .into_iter()
            .map(|(id, zone)| (id.max(0) as u64, zone))
            .collect())
    }

    /// Highest journaled command id, 0 when the journal is empty.
    pub async fn max_command_id(&self) -> Result<u64> {
        let max: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(command_id), 0) FROM irrigation_commands")
                .fetch_one(&self.pool)
                .await
                .context("max_command_id failed")?;
        Ok(max.max(0) as u64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ShotTrigger;
    use time::macros::datetime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn snapshot(zone: &str) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: zone.into(),
            phase: Phase::P2,
            peak_vwc: Some(62.5),
            last_irrigation_at: Some(datetime!(2026-03-01 09:30 UTC)),
            p1_entered_at: Some(datetime!(2026-03-01 06:00 UTC)),
            shots: [0, 3, 4, 0],
            updated_at: datetime!(2026-03-01 09:31 UTC),
        }
    }

    fn command(id: u64) -> IrrigationCommand {
        IrrigationCommand {
            command_id: id,
            zone_id: "z1".into(),
            issued_at: datetime!(2026-03-01 09:30 UTC),
            dose: Dose::Volume { liters: 0.325 },
            phase: Phase::P2,
            trigger: ShotTrigger::Dryback,
        }
    }

    async fn status_of(db: &Db, id: u64) -> String {
        sqlx::query_scalar("SELECT status FROM irrigation_commands WHERE command_id = ?")
            .bind(id as i64)
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    // -- Zone state ---------------------------------------------------------

    #[tokio::test]
    async fn zone_state_round_trips() {
        let db = test_db().await;
        db.save_zone_state(&snapshot("z1")).await.unwrap();

        let loaded = db.load_zone_states().await.unwrap();
        assert_eq!(loaded, vec![snapshot("z1")]);
    }

    #[tokio::test]
    async fn zone_state_upsert_overwrites() {
        let db = test_db().await;
        db.save_zone_state(&snapshot("z1")).await.unwrap();

        let mut next = snapshot("z1");
        next.phase = Phase::P3;
        next.peak_vwc = None;
        next.shots = [0, 3, 5, 1];
        db.save_zone_state(&next).await.unwrap();

        let loaded = db.load_zone_states().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].phase, Phase::P3);
        assert_eq!(loaded[0].peak_vwc, None);
        assert_eq!(loaded[0].shots, [0, 3, 5, 1]);
    }

    #[tokio::test]
    async fn unparseable_phase_row_skipped() {
        let db = test_db().await;
        db.save_zone_state(&snapshot("z1")).await.unwrap();
        sqlx::query("UPDATE zone_state SET phase = 'P9' WHERE zone_id = 'z1'")
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(db.load_zone_states().await.unwrap().is_empty());
    }

    // -- Command journal ----------------------------------------------------

    #[tokio::test]
    async fn command_journal_resolves_once() {
        let db = test_db().await;
        db.insert_command(&command(1)).await.unwrap();
        assert_eq!(status_of(&db, 1).await, "pending");

        let at = datetime!(2026-03-01 09:31 UTC);
        assert!(db.resolve_command(1, CommandStatus::Executed, at).await.unwrap());
        assert_eq!(status_of(&db, 1).await, "executed");

        // Late ack after resolution does not overwrite.
        assert!(!db.resolve_command(1, CommandStatus::Failed, at).await.unwrap());
        assert_eq!(status_of(&db, 1).await, "executed");
    }

    #[tokio::test]
    async fn resolve_unknown_command_is_false() {
        let db = test_db().await;
        let at = datetime!(2026-03-01 09:31 UTC);
        assert!(!db.resolve_command(99, CommandStatus::Timeout, at).await.unwrap());
    }

    #[tokio::test]
    async fn expire_pending_times_out_unresolved_rows() {
        let db = test_db().await;
        db.insert_command(&command(3)).await.unwrap();
        db.insert_command(&command(1)).await.unwrap();
        db.insert_command(&command(2)).await.unwrap();
        let at = datetime!(2026-03-01 09:31 UTC);
        db.resolve_command(2, CommandStatus::Executed, at).await.unwrap();

        let expired = db.expire_pending(at).await.unwrap();
        let ids: Vec<u64> = expired.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(status_of(&db, 1).await, "timeout");
        assert_eq!(status_of(&db, 2).await, "executed");
        assert_eq!(status_of(&db, 3).await, "timeout");

        assert!(db.expire_pending(at).await.unwrap().is_empty());
        assert!(!db.resolve_command(1, CommandStatus::Executed, at).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_command_id_rejected() {
        let db = test_db().await;
        db.insert_command(&command(1)).await.unwrap();
        assert!(db.insert_command(&command(1)).await.is_err());
    }

    #[tokio::test]
    async fn max_command_id_tracks_journal() {
        let db = test_db().await;
        assert_eq!(db.max_command_id().await.unwrap(), 0);
        db.insert_command(&command(4)).await.unwrap();
        db.insert_command(&command(11)).await.unwrap();
        assert_eq!(db.max_command_id().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn duration_dose_journals_seconds() {
        let db = test_db().await;
        let cmd = IrrigationCommand {
            dose: Dose::Duration {
                seconds: 25,
                liters: 0.5,
            },
            ..command(2)
        };
        db.insert_command(&cmd).await.unwrap();
        let secs: Option<i64> =
            sqlx::query_scalar("SELECT duration_sec FROM irrigation_commands WHERE command_id = 2")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(secs, Some(25));
    }
}
