use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Largest score the store can hold (`SQLite` integers are signed 64-bit).
pub const MAX_KARMA_SCORE: u64 = 9_223_372_036_854_775_807;

const MAX_WIZARD_ID_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KarmaError {
    #[error("wizard not found: {0}")]
    UserNotFound(String),
    #[error("invalid reason code: {0}")]
    InvalidReasonCode(String),
    #[error("invalid rank: {0}")]
    InvalidRank(String),
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("daily login bonus already granted to {wizard_id} on {day}")]
    DailyBonusAlreadyGranted { wizard_id: String, day: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rank {
    #[serde(rename = "E_RANK")]
    ERank,
    #[serde(rename = "D_RANK")]
    DRank,
    #[serde(rename = "C_RANK")]
    CRank,
    #[serde(rename = "B_RANK")]
    BRank,
    #[serde(rename = "A_RANK")]
    ARank,
    #[serde(rename = "S_RANK")]
    SRank,
    #[serde(rename = "NATIONAL_RANK")]
    NationalRank,
    #[serde(rename = "SHADOW_MONARCH")]
    ShadowMonarch,
}

impl Rank {
    pub const ALL: [Self; 8] = [
        Self::ERank,
        Self::DRank,
        Self::CRank,
        Self::BRank,
        Self::ARank,
        Self::SRank,
        Self::NationalRank,
        Self::ShadowMonarch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ERank => "E_RANK",
            Self::DRank => "D_RANK",
            Self::CRank => "C_RANK",
            Self::BRank => "B_RANK",
            Self::ARank => "A_RANK",
            Self::SRank => "S_RANK",
            Self::NationalRank => "NATIONAL_RANK",
            Self::ShadowMonarch => "SHADOW_MONARCH",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "E_RANK" => Some(Self::ERank),
            "D_RANK" => Some(Self::DRank),
            "C_RANK" => Some(Self::CRank),
            "B_RANK" => Some(Self::BRank),
            "A_RANK" => Some(Self::ARank),
            "S_RANK" => Some(Self::SRank),
            "NATIONAL_RANK" => Some(Self::NationalRank),
            "SHADOW_MONARCH" => Some(Self::ShadowMonarch),
            _ => None,
        }
    }

    /// The rank every new wizard starts at.
    #[must_use]
    pub fn lowest() -> Self {
        Self::ERank
    }
}

impl Display for Rank {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    DailyLogin,
    ReturnLostItem,
    SellItem,
    BuyItem,
    FiveStarRating,
}

impl ReasonCode {
    pub const ALL: [Self; 5] = [
        Self::DailyLogin,
        Self::ReturnLostItem,
        Self::SellItem,
        Self::BuyItem,
        Self::FiveStarRating,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DailyLogin => "daily_login",
            Self::ReturnLostItem => "return_lost_item",
            Self::SellItem => "sell_item",
            Self::BuyItem => "buy_item",
            Self::FiveStarRating => "five_star_rating",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily_login" => Some(Self::DailyLogin),
            "return_lost_item" => Some(Self::ReturnLostItem),
            "sell_item" => Some(Self::SellItem),
            "buy_item" => Some(Self::BuyItem),
            "five_star_rating" => Some(Self::FiveStarRating),
            _ => None,
        }
    }

    /// Strict variant of [`ReasonCode::parse`] for untrusted input.
    ///
    /// # Errors
    /// Returns [`KarmaError::InvalidReasonCode`] for unknown codes.
    pub fn from_wire(value: &str) -> Result<Self, KarmaError> {
        Self::parse(value).ok_or_else(|| KarmaError::InvalidReasonCode(value.to_string()))
    }
}

impl Display for ReasonCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    KarmaEarned,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KarmaEarned => "karma_earned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "karma_earned" => Some(Self::KarmaEarned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Dispatched,
    Failed,
}

impl NotificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "dispatched" => Some(Self::Dispatched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Opaque wizard identifier issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct WizardId(String);

impl WizardId {
    /// # Errors
    /// Returns [`KarmaError::Validation`] for empty, oversized or
    /// whitespace-containing identifiers.
    pub fn parse(value: &str) -> Result<Self, KarmaError> {
        if value.is_empty() {
            return Err(KarmaError::Validation(
                "wizard_id MUST be provided".to_string(),
            ));
        }

        if value.len() > MAX_WIZARD_ID_LEN {
            return Err(KarmaError::Validation(format!(
                "wizard_id MUST be at most {MAX_WIZARD_ID_LEN} bytes"
            )));
        }

        if value.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(KarmaError::Validation(
                "wizard_id cannot contain whitespace or control characters".to_string(),
            ));
        }

        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Private realtime channel the relay delivers this wizard's events on.
    #[must_use]
    pub fn private_channel(&self) -> String {
        format!("private-user-{}", self.0)
    }
}

impl Display for WizardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankThreshold {
    pub rank: Rank,
    pub min_score: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankTable {
    pub thresholds: Vec<RankThreshold>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankProgress {
    pub score: u64,
    pub rank: Rank,
    pub next_rank: Option<Rank>,
    pub next_threshold: Option<u64>,
    pub points_to_next: Option<u64>,
}

const fn tier(rank: Rank, min_score: u64) -> RankThreshold {
    RankThreshold { rank, min_score }
}

impl RankTable {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            thresholds: vec![
                tier(Rank::ERank, 0),
                tier(Rank::DRank, 50),
                tier(Rank::CRank, 150),
                tier(Rank::BRank, 400),
                tier(Rank::ARank, 1_000),
                tier(Rank::SRank, 2_500),
                tier(Rank::NationalRank, 5_000),
                tier(Rank::ShadowMonarch, 10_000),
            ],
        }
    }

    /// Checks that every rank appears once, in order, with strictly
    /// increasing thresholds starting at zero.
    ///
    /// # Errors
    /// Returns [`KarmaError::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<(), KarmaError> {
        if self.thresholds.len() != Rank::ALL.len() {
            return Err(KarmaError::Configuration(format!(
                "rank table MUST define exactly {} ranks, got {}",
                Rank::ALL.len(),
                self.thresholds.len()
            )));
        }

        for (expected, entry) in Rank::ALL.iter().zip(&self.thresholds) {
            if entry.rank != *expected {
                return Err(KarmaError::Configuration(format!(
                    "rank table out of order: expected {expected}, got {}",
                    entry.rank
                )));
            }
        }

        if self.thresholds[0].min_score != 0 {
            return Err(KarmaError::Configuration(
                "lowest rank threshold MUST be 0".to_string(),
            ));
        }

        for pair in self.thresholds.windows(2) {
            if pair[1].min_score <= pair[0].min_score {
                return Err(KarmaError::Configuration(format!(
                    "threshold for {} MUST exceed threshold for {}",
                    pair[1].rank, pair[0].rank
                )));
            }
        }

        Ok(())
    }

    /// Highest rank whose threshold is at or below `score`.
    #[must_use]
    pub fn rank_of(&self, score: u64) -> Rank {
        self.thresholds
            .iter()
            .rev()
            .find(|entry| entry.min_score <= score)
            .map_or(Rank::lowest(), |entry| entry.rank)
    }

    #[must_use]
    pub fn threshold(&self, rank: Rank) -> Option<u64> {
        self.thresholds
            .iter()
            .find(|entry| entry.rank == rank)
            .map(|entry| entry.min_score)
    }

    #[must_use]
    pub fn next_rank(&self, rank: Rank) -> Option<RankThreshold> {
        self.thresholds
            .iter()
            .find(|entry| entry.rank > rank)
            .copied()
    }

    #[must_use]
    pub fn progress(&self, score: u64) -> RankProgress {
        let rank = self.rank_of(score);
        let next = self.next_rank(rank);
        RankProgress {
            score,
            rank,
            next_rank: next.map(|entry| entry.rank),
            next_threshold: next.map(|entry| entry.min_score),
            points_to_next: next.map(|entry| entry.min_score.saturating_sub(score)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreTransition {
    pub new_score: u64,
    pub new_rank: Rank,
    pub previous_rank: Rank,
    pub rank_changed: bool,
}

/// Applies `delta` to a score and derives the resulting rank.
///
/// Negative results clamp to zero. The new rank is always recomputed from the
/// score; `current_rank` only feeds `rank_changed`, so a stale cached rank
/// cannot leak into the result.
///
/// # Errors
/// Returns [`KarmaError::InvalidDelta`] when the result exceeds
/// [`MAX_KARMA_SCORE`].
pub fn apply_delta(
    table: &RankTable,
    current_score: u64,
    current_rank: Rank,
    delta: i64,
) -> Result<ScoreTransition, KarmaError> {
    let raw = i128::from(current_score) + i128::from(delta);
    let new_score = u64::try_from(raw.max(0))
        .ok()
        .filter(|value| *value <= MAX_KARMA_SCORE)
        .ok_or_else(|| {
            KarmaError::InvalidDelta(format!(
                "score {current_score} + {delta} exceeds the maximum karma score"
            ))
        })?;

    let new_rank = table.rank_of(new_score);
    Ok(ScoreTransition {
        new_score,
        new_rank,
        previous_rank: table.rank_of(current_score),
        rank_changed: new_rank != current_rank,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KarmaConfig {
    pub config_version: u32,
    pub rank_table: RankTable,
    pub reason_amounts: BTreeMap<ReasonCode, u32>,
    /// Offset of server time from UTC, used to cut calendar days.
    pub day_offset_minutes: i16,
}

impl KarmaConfig {
    #[must_use]
    pub fn v1() -> Self {
        let reason_amounts = BTreeMap::from([
            (ReasonCode::DailyLogin, 1),
            (ReasonCode::ReturnLostItem, 50),
            (ReasonCode::SellItem, 10),
            (ReasonCode::BuyItem, 5),
            (ReasonCode::FiveStarRating, 10),
        ]);

        Self {
            config_version: 1,
            rank_table: RankTable::v1(),
            reason_amounts,
            day_offset_minutes: 0,
        }
    }

    /// # Errors
    /// Returns [`KarmaError::Configuration`] when the rank table, reason
    /// amounts or day offset are out of bounds.
    pub fn validate(&self) -> Result<(), KarmaError> {
        if self.config_version == 0 {
            return Err(KarmaError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        self.rank_table.validate()?;

        for reason in ReasonCode::ALL {
            match self.reason_amounts.get(&reason) {
                Some(amount) if *amount > 0 => {}
                Some(_) => {
                    return Err(KarmaError::Configuration(format!(
                        "amount for {reason} MUST be > 0"
                    )))
                }
                None => {
                    return Err(KarmaError::Configuration(format!(
                        "missing amount for reason {reason}"
                    )))
                }
            }
        }

        if self.day_offset_minutes.unsigned_abs() >= 24 * 60 {
            return Err(KarmaError::Configuration(
                "day_offset_minutes MUST be within one day of UTC".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`KarmaError::Configuration`] when decoding fails or the
    /// decoded values violate config constraints.
    pub fn from_json(value: &Value) -> Result<Self, KarmaError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KarmaError::Configuration(format!("invalid karma config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`KarmaError::InvalidReasonCode`] when the reason has no
    /// configured amount.
    pub fn amount_for(&self, reason: ReasonCode) -> Result<i64, KarmaError> {
        self.reason_amounts
            .get(&reason)
            .map(|amount| i64::from(*amount))
            .ok_or_else(|| KarmaError::InvalidReasonCode(reason.as_str().to_string()))
    }

    /// # Errors
    /// Returns [`KarmaError::Configuration`] for an unrepresentable offset.
    pub fn day_offset(&self) -> Result<UtcOffset, KarmaError> {
        UtcOffset::from_whole_seconds(i32::from(self.day_offset_minutes) * 60)
            .map_err(|err| KarmaError::Configuration(format!("invalid day offset: {err}")))
    }

    /// Calendar day (`YYYY-MM-DD`) of `at` in server time.
    ///
    /// # Errors
    /// Returns [`KarmaError::Configuration`] for an unrepresentable offset.
    pub fn award_day(&self, at: OffsetDateTime) -> Result<String, KarmaError> {
        let local = at.to_offset(self.day_offset()?);
        Ok(format_day(local.date()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WizardRegistration {
    pub wizard_id: WizardId,
    pub display_name: String,
}

impl WizardRegistration {
    /// # Errors
    /// Returns [`KarmaError::Validation`] when the display name is blank.
    pub fn validate(&self) -> Result<(), KarmaError> {
        if self.display_name.trim().is_empty() {
            return Err(KarmaError::Validation(
                "display_name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wizard {
    pub wizard_id: WizardId,
    pub display_name: String,
    pub karma_score: u64,
    pub karma_rank: Rank,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwardInput {
    pub wizard_id: WizardId,
    pub delta: i64,
    pub reason: ReasonCode,
    pub reference_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl AwardInput {
    /// # Errors
    /// Returns [`KarmaError::InvalidDelta`] for a zero delta or a
    /// non-positive `daily_login` delta, and [`KarmaError::Validation`] for non-UTC timestamps or blank references.
    pub fn validate(&self) -> Result<(), KarmaError> {
        if self.delta == 0 {
            return Err(KarmaError::InvalidDelta(
                "delta MUST be non-zero".to_string(),
            ));
        }

        // A daily_login row consumes the day's bonus slot.
        if self.reason == ReasonCode::DailyLogin && self.delta < 0 {
            return Err(KarmaError::InvalidDelta(
                "daily_login delta MUST be positive".to_string(),
            ));
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(KarmaError::Validation(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        if let Some(reference) = &self.reference_id {
            if reference.trim().is_empty() {
                return Err(KarmaError::Validation(
                    "reference_id cannot be empty when provided".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub wizard_id: WizardId,
    pub delta: i64,
    pub reason: ReasonCode,
    pub score_after: u64,
    pub rank_after: Rank,
    pub reference_id: Option<String>,
    pub award_day: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub notification_id: Ulid,
    pub kind: NotificationKind,
    pub wizard_id: WizardId,
    pub reference_id: Option<String>,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxRecord {
    pub event: NotificationEvent,
    pub status: NotificationStatus,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatched_at: Option<OffsetDateTime>,
}

/// Result of one committed award.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardOutcome {
    pub wizard_id: WizardId,
    pub delta: i64,
    pub reason: ReasonCode,
    pub new_score: u64,
    pub new_rank: Rank,
    pub previous_rank: Rank,
    pub rank_changed: bool,
    pub entry: LedgerEntry,
    pub notification: Option<NotificationEvent>,
    /// `true` once the relay accepted the notification.
    pub dispatched: bool,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("relay transport failure: {0}")]
    Transport(String),
    #[error("relay rejected event with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("dispatcher configuration error: {0}")]
    Configuration(String),
}

/// Delivery seam towards the realtime relay.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatcher_name(&self) -> &'static str;

    /// `false` when events handed to [`Self::dispatch`] never reach a
    /// client. Such events stay pending in the outbox.
    fn delivers(&self) -> bool {
        true
    }

    /// Best-effort delivery; callers never retry.
    ///
    /// # Errors
    /// Returns [`DispatchError`] when the relay is unreachable or rejects
    /// the event.
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError>;
}

/// Builds the `karma_earned` payload delivered to the wizard's client.
#[must_use]
pub fn karma_earned_payload(
    delta: i64,
    reason: ReasonCode,
    transition: &ScoreTransition,
) -> Value {
    serde_json::json!({
        "delta": delta,
        "reason": reason.as_str(),
        "karma_score": transition.new_score,
        "karma_rank": transition.new_rank.as_str(),
        "previous_rank": transition.previous_rank.as_str(),
        "rank_changed": transition.rank_changed,
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`KarmaError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, KarmaError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| KarmaError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(KarmaError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`KarmaError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, KarmaError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| KarmaError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn format_day(date: time::Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
