#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use anyhow::Result;
use karma_core::{
    now_utc, AwardInput, AwardOutcome, KarmaConfig, KarmaError, NotificationDispatcher,
    NotificationEvent, ReasonCode, WizardId,
};
use karma_store_sqlite::{is_transient, SqliteKarmaStore};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 25,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 0,
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyBonusOutcome {
    pub wizard_id: WizardId,
    pub granted: bool,
    pub day: String,
    pub award: Option<AwardOutcome>,
}

/// Single entry point for every karma change.
pub struct ReputationService<'a> {
    store: &'a mut SqliteKarmaStore,
    dispatcher: &'a dyn NotificationDispatcher,
    config: &'a KarmaConfig,
    retry: RetryPolicy,
}

impl<'a> ReputationService<'a> {
    pub fn new(
        store: &'a mut SqliteKarmaStore,
        dispatcher: &'a dyn NotificationDispatcher,
        config: &'a KarmaConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn award(
        &mut self,
        wizard_id: &WizardId,
        delta: i64,
        reason: ReasonCode,
        reference_id: Option<&str>,
    ) -> Result<AwardOutcome> {
        self.award_at(wizard_id, delta, reason, reference_id, now_utc())
    }

    /// Commits the award, then hands the notification to the dispatcher.
    /// A dispatch failure is recorded on the outbox row and never undoes
    /// the committed score.
    pub fn award_at(
        &mut self,
        wizard_id: &WizardId,
        delta: i64,
        reason: ReasonCode,
        reference_id: Option<&str>,
        occurred_at: OffsetDateTime,
    ) -> Result<AwardOutcome> {
        let input = AwardInput {
            wizard_id: wizard_id.clone(),
            delta,
            reason,
            reference_id: reference_id.map(str::to_string),
            occurred_at: occurred_at.to_offset(UtcOffset::UTC),
        };

        let mut outcome = self.commit_with_retry(&input)?;
        info!(
            wizard_id = %outcome.wizard_id,
            delta = outcome.delta,
            reason = %outcome.reason,
            new_score = outcome.new_score,
            new_rank = %outcome.new_rank,
            rank_changed = outcome.rank_changed,
            entry_seq = outcome.entry.entry_seq,
            "karma awarded"
        );

        if let Some(event) = &outcome.notification {
            outcome.dispatched = self.deliver(event);
        }

        Ok(outcome)
    }

    /// Awards the configured amount for `reason`.
    pub fn award_for(
        &mut self,
        wizard_id: &WizardId,
        reason: ReasonCode,
        reference_id: Option<&str>,
    ) -> Result<AwardOutcome> {
        let delta = self.config.amount_for(reason)?;
        self.award(wizard_id, delta, reason, reference_id)
    }

    pub fn grant_daily_login_bonus(&mut self, wizard_id: &WizardId) -> Result<DailyBonusOutcome> {
        self.grant_daily_login_bonus_at(wizard_id, now_utc())
    }

    /// At most one `daily_login` award per wizard per server calendar day.
    pub fn grant_daily_login_bonus_at(
        &mut self,
        wizard_id: &WizardId,
        now: OffsetDateTime,
    ) -> Result<DailyBonusOutcome> {
        let now = now.to_offset(UtcOffset::UTC);
        let day = self.config.award_day(now)?;

        if self
            .store
            .has_ledger_entry_on_day(wizard_id, ReasonCode::DailyLogin, &day)?
        {
            debug!(wizard_id = %wizard_id, day = %day, "daily bonus already granted");
            return Ok(DailyBonusOutcome {
                wizard_id: wizard_id.clone(),
                granted: false,
                day,
                award: None,
            });
        }

        let delta = self.config.amount_for(ReasonCode::DailyLogin)?;
        match self.award_at(wizard_id, delta, ReasonCode::DailyLogin, None, now) {
            Ok(award) => {
                info!(wizard_id = %wizard_id, day = %day, "daily bonus granted");
                Ok(DailyBonusOutcome {
                    wizard_id: wizard_id.clone(),
                    granted: true,
                    day,
                    award: Some(award),
                })
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<KarmaError>(),
                    Some(KarmaError::DailyBonusAlreadyGranted { .. })
                ) =>
            {
                debug!(wizard_id = %wizard_id, day = %day, "daily bonus lost race to concurrent grant");
                Ok(DailyBonusOutcome {
                    wizard_id: wizard_id.clone(),
                    granted: false,
                    day,
                    award: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn commit_with_retry(&mut self, input: &AwardInput) -> Result<AwardOutcome> {
        let mut attempt = 1_u32;
        loop {
            match self.store.apply_award(self.config, input) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < self.retry.max_attempts && is_transient(&err) => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        wizard_id = %input.wizard_id,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %format!("{err:#}"),
                        "karma store busy, retrying award"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn deliver(&self, event: &NotificationEvent) -> bool {
        if !self.dispatcher.delivers() {
            debug!(
                dispatcher = self.dispatcher.dispatcher_name(),
                notification_id = %event.notification_id,
                "dispatcher does not deliver, notification left pending"
            );
            return false;
        }

        match self.dispatcher.dispatch(event) {
            Ok(()) => {
                if let Err(err) = self
                    .store
                    .mark_notification_dispatched(event.notification_id, now_utc())
                {
                    warn!(
                        notification_id = %event.notification_id,
                        error = %format!("{err:#}"),
                        "notification delivered but outbox update failed"
                    );
                }
                true
            }
            Err(err) => {
                warn!(
                    dispatcher = self.dispatcher.dispatcher_name(),
                    notification_id = %event.notification_id,
                    wizard_id = %event.wizard_id,
                    error = %err,
                    "notification dispatch failed"
                );
                if let Err(mark_err) = self
                    .store
                    .mark_notification_failed(event.notification_id, &err.to_string())
                {
                    warn!(
                        notification_id = %event.notification_id,
                        error = %format!("{mark_err:#}"),
                        "failed to record dispatch failure"
                    );
                }
                false
            }
        }
    }
}
