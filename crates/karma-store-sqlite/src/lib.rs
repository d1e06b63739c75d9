#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use karma_core::{
    apply_delta, format_rfc3339, karma_earned_payload, now_utc, parse_rfc3339_utc, AwardInput,
    AwardOutcome, KarmaConfig, KarmaError, LedgerEntry, NotificationEvent, NotificationKind,
    NotificationStatus, OutboxRecord, Rank, RankTable, ReasonCode, Wizard, WizardId,
    WizardRegistration,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const KARMA_MIGRATION_VERSION: i64 = 1;
const AUDIT_CONTRACT_VERSION: &str = "karma_audit.v1";

const SCHEMA_KARMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS wizards (
  wizard_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  karma_score INTEGER NOT NULL DEFAULT 0 CHECK (karma_score >= 0),
  karma_rank TEXT NOT NULL CHECK (
    karma_rank IN (
      'E_RANK',
      'D_RANK',
      'C_RANK',
      'B_RANK',
      'A_RANK',
      'S_RANK',
      'NATIONAL_RANK',
      'SHADOW_MONARCH'
    )
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wizards_leaderboard
  ON wizards(karma_score DESC, wizard_id ASC);

CREATE TABLE IF NOT EXISTS karma_ledger (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  wizard_id TEXT NOT NULL,
  delta INTEGER NOT NULL CHECK (delta <> 0),
  reason TEXT NOT NULL CHECK (
    reason IN (
      'daily_login',
      'return_lost_item',
      'sell_item',
      'buy_item',
      'five_star_rating'
    )
  ),
  score_after INTEGER NOT NULL CHECK (score_after >= 0),
  rank_after TEXT NOT NULL,
  reference_id TEXT,
  award_day TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (wizard_id) REFERENCES wizards(wizard_id)
);

CREATE TRIGGER IF NOT EXISTS trg_karma_ledger_no_update
BEFORE UPDATE ON karma_ledger
BEGIN
  SELECT RAISE(FAIL, 'karma_ledger is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_karma_ledger_no_delete
BEFORE DELETE ON karma_ledger
BEGIN
  SELECT RAISE(FAIL, 'karma_ledger is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_karma_ledger_wizard_seq
  ON karma_ledger(wizard_id, entry_seq);

CREATE UNIQUE INDEX IF NOT EXISTS uq_karma_ledger_daily_login
  ON karma_ledger(wizard_id, award_day)
  WHERE reason = 'daily_login';

CREATE TABLE IF NOT EXISTS notification_outbox (
  notification_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('karma_earned')),
  wizard_id TEXT NOT NULL,
  entry_seq INTEGER NOT NULL,
  reference_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}',
  status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'dispatched', 'failed')),
  last_error TEXT,
  created_at TEXT NOT NULL,
  dispatched_at TEXT,
  FOREIGN KEY (wizard_id) REFERENCES wizards(wizard_id),
  FOREIGN KEY (entry_seq) REFERENCES karma_ledger(entry_seq)
);

CREATE INDEX IF NOT EXISTS idx_notification_outbox_status
  ON notification_outbox(status, created_at);
";

const WIZARD_COLUMNS: &str =
    "wizard_id, display_name, karma_score, karma_rank, created_at, updated_at";

const LEDGER_COLUMNS: &str = "entry_seq, entry_id, wizard_id, delta, reason, score_after, \
     rank_after, reference_id, award_day, created_at";

const OUTBOX_COLUMNS: &str = "notification_id, kind, wizard_id, reference_id, payload_json, \
     status, last_error, created_at, dispatched_at";

pub struct SqliteKarmaStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AuditIssue {
    pub code: String,
    pub severity: AuditIssueSeverity,
    pub wizard_id: Option<WizardId>,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub contract_version: String,
    pub healthy: bool,
    pub wizards_checked: usize,
    pub ledger_entries: usize,
    pub pending_notifications: usize,
    pub failed_notifications: usize,
    pub issues: Vec<AuditIssue>,
}

impl SqliteKarmaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Overrides how long a write waits on a held lock before failing busy.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .busy_timeout(timeout)
            .context("failed to set sqlite busy timeout")
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_KARMA_V1)
            .context("failed to apply karma schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KARMA_MIGRATION_VERSION, now],
            )
            .context("failed to register karma schema migration")?;

        if inserted > 0 {
            debug!(version = KARMA_MIGRATION_VERSION, "applied karma schema migration");
        }

        Ok(())
    }

    /// Creates the wizard at score 0 and the lowest rank on first sign-in.
    /// Later calls return the existing record untouched.
    pub fn register_wizard(&self, registration: &WizardRegistration) -> Result<Wizard> {
        registration
            .validate()
            .map_err(|err| anyhow!("wizard registration validation failed: {err}"))?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO wizards(
                    wizard_id, display_name, karma_score, karma_rank, created_at, updated_at
                 ) VALUES (?1, ?2, 0, ?3, ?4, ?4)",
                params![
                    registration.wizard_id.as_str(),
                    registration.display_name.trim(),
                    Rank::lowest().as_str(),
                    now
                ],
            )
            .context("failed to register wizard")?;

        self.get_wizard(&registration.wizard_id)?
            .ok_or_else(|| anyhow!("wizard {} missing after registration", registration.wizard_id))
    }

    pub fn get_wizard(&self, wizard_id: &WizardId) -> Result<Option<Wizard>> {
        self.conn
            .query_row(
                &format!("SELECT {WIZARD_COLUMNS} FROM wizards WHERE wizard_id = ?1"),
                params![wizard_id.as_str()],
                parse_wizard_row,
            )
            .optional()
            .with_context(|| format!("failed to load wizard {wizard_id}"))
    }

    pub fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<Wizard>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WIZARD_COLUMNS}
             FROM wizards
             ORDER BY karma_score DESC, wizard_id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![sql_limit(limit)], parse_wizard_row)?;
        collect_rows(rows)
    }

    /// Applies one award atomically: wizard update, ledger entry and (for
    /// positive deltas) a `karma_earned` outbox row commit together or not
    /// at all.
    ///
    /// The transaction takes the write lock before reading the current score,
    /// so concurrent awards for the same wizard serialize instead of losing
    /// updates. Typed failures are [`KarmaError::UserNotFound`],
    /// [`KarmaError::InvalidDelta`] and
    /// [`KarmaError::DailyBonusAlreadyGranted`], all recoverable with
    /// `downcast_ref`.
    pub fn apply_award(&mut self, config: &KarmaConfig, input: &AwardInput) -> Result<AwardOutcome> {
        input.validate().map_err(anyhow::Error::new)?;

        let award_day = config.award_day(input.occurred_at)?;
        let occurred_at = format_rfc3339(input.occurred_at)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start award transaction")?;

        let current = tx
            .query_row(
                "SELECT karma_score, karma_rank FROM wizards WHERE wizard_id = ?1",
                params![input.wizard_id.as_str()],
                |row| {
                    let score_raw: i64 = row.get(0)?;
                    let rank_raw: String = row.get(1)?;
                    Ok((parse_score(0, score_raw)?, parse_rank(1, &rank_raw)?))
                },
            )
            .optional()
            .context("failed to read current karma")?;

        let Some((current_score, current_rank)) = current else {
            return Err(KarmaError::UserNotFound(input.wizard_id.to_string()).into());
        };

        let transition = apply_delta(&config.rank_table, current_score, current_rank, input.delta)?;
        let new_score_sql = i64::try_from(transition.new_score)
            .map_err(|_| KarmaError::InvalidDelta("score exceeds storage range".to_string()))?;

        tx.execute(
            "UPDATE wizards
             SET karma_score = ?2, karma_rank = ?3, updated_at = ?4
             WHERE wizard_id = ?1",
            params![
                input.wizard_id.as_str(),
                new_score_sql,
                transition.new_rank.as_str(),
                occurred_at
            ],
        )
        .context("failed to update wizard karma")?;

        let entry_id = Ulid::new();
        let inserted = tx.execute(
            "INSERT INTO karma_ledger(
                entry_id, wizard_id, delta, reason, score_after,
                rank_after, reference_id, award_day, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry_id.to_string(),
                input.wizard_id.as_str(),
                input.delta,
                input.reason.as_str(),
                new_score_sql,
                transition.new_rank.as_str(),
                input.reference_id,
                award_day,
                occurred_at
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if input.reason == ReasonCode::DailyLogin && is_unique_violation(&err) => {
                return Err(KarmaError::DailyBonusAlreadyGranted {
                    wizard_id: input.wizard_id.to_string(),
                    day: award_day,
                }
                .into());
            }
            Err(err) => return Err(err).context("failed to append karma ledger entry"),
        }
        let entry_seq = tx.last_insert_rowid();

        let notification = if input.delta > 0 {
            let event = NotificationEvent {
                notification_id: Ulid::new(),
                kind: NotificationKind::KarmaEarned,
                wizard_id: input.wizard_id.clone(),
                reference_id: input.reference_id.clone(),
                payload: karma_earned_payload(input.delta, input.reason, &transition),
                created_at: input.occurred_at,
            };
            tx.execute(
                "INSERT INTO notification_outbox(
                    notification_id, kind, wizard_id, entry_seq, reference_id,
                    payload_json, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![
                    event.notification_id.to_string(),
                    event.kind.as_str(),
                    event.wizard_id.as_str(),
                    entry_seq,
                    event.reference_id,
                    serde_json::to_string(&event.payload)
                        .context("failed to serialize notification payload")?,
                    occurred_at
                ],
            )
            .context("failed to enqueue karma notification")?;
            Some(event)
        } else {
            None
        };

        tx.commit().context("failed to commit award transaction")?;

        Ok(AwardOutcome {
            wizard_id: input.wizard_id.clone(),
            delta: input.delta,
            reason: input.reason,
            new_score: transition.new_score,
            new_rank: transition.new_rank,
            previous_rank: transition.previous_rank,
            rank_changed: transition.rank_changed,
            entry: LedgerEntry {
                entry_seq,
                entry_id,
                wizard_id: input.wizard_id.clone(),
                delta: input.delta,
                reason: input.reason,
                score_after: transition.new_score,
                rank_after: transition.new_rank,
                reference_id: input.reference_id.clone(),
                award_day,
                created_at: input.occurred_at,
            },
            notification,
            dispatched: false,
        })
    }

    pub fn has_ledger_entry_on_day(
        &self,
        wizard_id: &WizardId,
        reason: ReasonCode,
        award_day: &str,
    ) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1
                 FROM karma_ledger
                 WHERE wizard_id = ?1 AND reason = ?2 AND award_day = ?3
                 LIMIT 1",
                params![wizard_id.as_str(), reason.as_str(), award_day],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query karma ledger")?
            .is_some();

        Ok(exists)
    }

    pub fn list_ledger(&self, wizard_id: &WizardId, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEDGER_COLUMNS}
             FROM karma_ledger
             WHERE wizard_id = ?1
             ORDER BY entry_seq ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![wizard_id.as_str(), sql_limit(limit)],
            parse_ledger_row,
        )?;
        collect_rows(rows)
    }

    /// Outbox rows the relay has not accepted yet (pending or failed).
    pub fn list_undelivered_notifications(&self, limit: Option<usize>) -> Result<Vec<OutboxRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS}
             FROM notification_outbox
             WHERE status <> 'dispatched'
             ORDER BY created_at ASC, notification_id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![sql_limit(limit)], parse_outbox_row)?;
        collect_rows(rows)
    }

    pub fn get_notification(&self, notification_id: Ulid) -> Result<Option<OutboxRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE notification_id = ?1"
                ),
                params![notification_id.to_string()],
                parse_outbox_row,
            )
            .optional()
            .with_context(|| format!("failed to load notification {notification_id}"))
    }

    pub fn mark_notification_dispatched(
        &self,
        notification_id: Ulid,
        dispatched_at: OffsetDateTime,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE notification_outbox
                 SET status = 'dispatched', dispatched_at = ?2, last_error = NULL
                 WHERE notification_id = ?1",
                params![notification_id.to_string(), format_rfc3339(dispatched_at)?],
            )
            .context("failed to mark notification dispatched")?;

        if changed == 0 {
            return Err(anyhow!("notification {notification_id} not found"));
        }
        Ok(())
    }

    pub fn mark_notification_failed(&self, notification_id: Ulid, error: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE notification_outbox
                 SET status = 'failed', last_error = ?2
                 WHERE notification_id = ?1 AND status <> 'dispatched'",
                params![notification_id.to_string(), error],
            )
            .context("failed to mark notification failed")?;

        if changed == 0 {
            return Err(anyhow!(
                "notification {notification_id} not found or already dispatched"
            ));
        }
        Ok(())
    }

    /// Cross-checks stored ranks, ledger snapshots and the outbox.
    pub fn audit(&self, rank_table: &RankTable) -> Result<AuditReport> {
        let wizards = self.leaderboard(None)?;
        let mut issues = Vec::new();

        for wizard in &wizards {
            let expected = rank_table.rank_of(wizard.karma_score);
            if wizard.karma_rank != expected {
                issues.push(AuditIssue {
                    code: "rank_mismatch".to_string(),
                    severity: AuditIssueSeverity::Error,
                    wizard_id: Some(wizard.wizard_id.clone()),
                    message: format!(
                        "stored rank {} but score {} implies {}",
                        wizard.karma_rank, wizard.karma_score, expected
                    ),
                });
            }

            match self.latest_score_snapshot(&wizard.wizard_id)? {
                Some(snapshot) if snapshot != wizard.karma_score => issues.push(AuditIssue {
                    code: "ledger_score_mismatch".to_string(),
                    severity: AuditIssueSeverity::Error,
                    wizard_id: Some(wizard.wizard_id.clone()),
                    message: format!(
                        "stored score {} but latest ledger snapshot is {}",
                        wizard.karma_score, snapshot
                    ),
                }),
                None if wizard.karma_score > 0 => issues.push(AuditIssue {
                    code: "score_without_ledger".to_string(),
                    severity: AuditIssueSeverity::Error,
                    wizard_id: Some(wizard.wizard_id.clone()),
                    message: format!(
                        "stored score {} has no ledger history",
                        wizard.karma_score
                    ),
                }),
                _ => {}
            }
        }

        let ledger_entries = self.count_rows("SELECT COUNT(*) FROM karma_ledger")?;
        let pending_notifications = self.count_rows(
            "SELECT COUNT(*) FROM notification_outbox WHERE status = 'pending'",
        )?;
        let failed_notifications =
            self.count_rows("SELECT COUNT(*) FROM notification_outbox WHERE status = 'failed'")?;

        if pending_notifications > 0 {
            issues.push(AuditIssue {
                code: "notifications_pending".to_string(),
                severity: AuditIssueSeverity::Warning,
                wizard_id: None,
                message: format!("{pending_notifications} notification(s) awaiting dispatch"),
            });
        }
        if failed_notifications > 0 {
            issues.push(AuditIssue {
                code: "notifications_failed".to_string(),
                severity: AuditIssueSeverity::Warning,
                wizard_id: None,
                message: format!("{failed_notifications} notification(s) failed dispatch"),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == AuditIssueSeverity::Error);

        Ok(AuditReport {
            contract_version: AUDIT_CONTRACT_VERSION.to_string(),
            healthy,
            wizards_checked: wizards.len(),
            ledger_entries,
            pending_notifications,
            failed_notifications,
            issues,
        })
    }

    fn latest_score_snapshot(&self, wizard_id: &WizardId) -> Result<Option<u64>> {
        let raw: Option<i64> = self
            .conn
            .query_row(
                "SELECT score_after
                 FROM karma_ledger
                 WHERE wizard_id = ?1
                 ORDER BY entry_seq DESC
                 LIMIT 1",
                params![wizard_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read latest ledger snapshot")?;

        raw.map(|value| {
            u64::try_from(value).with_context(|| format!("invalid score_after: {value}"))
        })
        .transpose()
    }

    fn count_rows(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Whether `err` is lock contention worth retrying.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(inner, _))
                if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX))
}

fn parse_wizard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wizard> {
    let wizard_id_raw: String = row.get(0)?;
    let score_raw: i64 = row.get(2)?;
    let rank_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(4)?;
    let updated_at_raw: String = row.get(5)?;

    Ok(Wizard {
        wizard_id: parse_wizard_id(0, &wizard_id_raw)?,
        display_name: row.get(1)?,
        karma_score: parse_score(2, score_raw)?,
        karma_rank: parse_rank(3, &rank_raw)?,
        created_at: parse_timestamp(4, &created_at_raw)?,
        updated_at: parse_timestamp(5, &updated_at_raw)?,
    })
}

fn parse_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let entry_id_raw: String = row.get(1)?;
    let wizard_id_raw: String = row.get(2)?;
    let reason_raw: String = row.get(4)?;
    let score_raw: i64 = row.get(5)?;
    let rank_raw: String = row.get(6)?;
    let created_at_raw: String = row.get(9)?;

    let reason = ReasonCode::parse(&reason_raw).ok_or_else(|| {
        invalid_column(4, Type::Text, format!("invalid reason: {reason_raw}"))
    })?;

    Ok(LedgerEntry {
        entry_seq: row.get(0)?,
        entry_id: parse_ulid(1, &entry_id_raw)?,
        wizard_id: parse_wizard_id(2, &wizard_id_raw)?,
        delta: row.get(3)?,
        reason,
        score_after: parse_score(5, score_raw)?,
        rank_after: parse_rank(6, &rank_raw)?,
        reference_id: row.get(7)?,
        award_day: row.get(8)?,
        created_at: parse_timestamp(9, &created_at_raw)?,
    })
}

fn parse_outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let notification_id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let wizard_id_raw: String = row.get(2)?;
    let payload_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let created_at_raw: String = row.get(7)?;
    let dispatched_at_raw: Option<String> = row.get(8)?;

    let kind = NotificationKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(1, Type::Text, format!("invalid notification kind: {kind_raw}"))
    })?;
    let status = NotificationStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid notification status: {status_raw}"))
    })?;
    let payload: Value = serde_json::from_str(&payload_raw).map_err(|err| {
        invalid_column(4, Type::Text, format!("invalid payload_json: {err}"))
    })?;
    let dispatched_at = dispatched_at_raw
        .as_deref()
        .map(|raw| parse_timestamp(8, raw))
        .transpose()?;

    Ok(OutboxRecord {
        event: NotificationEvent {
            notification_id: parse_ulid(0, &notification_id_raw)?,
            kind,
            wizard_id: parse_wizard_id(2, &wizard_id_raw)?,
            reference_id: row.get(3)?,
            payload,
            created_at: parse_timestamp(7, &created_at_raw)?,
        },
        status,
        last_error: row.get(6)?,
        dispatched_at,
    })
}

fn parse_wizard_id(index: usize, raw: &str) -> rusqlite::Result<WizardId> {
    WizardId::parse(raw).map_err(|err| to_sql_error(index, &err))
}

fn parse_score(index: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|_| invalid_column(index, Type::Integer, format!("invalid karma score: {raw}")))
}

fn parse_rank(index: usize, raw: &str) -> rusqlite::Result<Rank> {
    Rank::parse(raw).ok_or_else(|| to_sql_error(index, &KarmaError::InvalidRank(raw.to_string())))
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw)
        .map_err(|_| invalid_column(index, Type::Text, format!("invalid ULID: {raw}")))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| to_sql_error(index, &err))
}

fn to_sql_error(index: usize, err: &KarmaError) -> rusqlite::Error {
    invalid_column(index, Type::Text, err.to_string())
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
