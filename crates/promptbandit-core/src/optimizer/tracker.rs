//! Performance tracking - redeem selection tokens and fold outcomes into stats
//!
//! A selection leaves a pending entry keyed by its token. Reporting an
//! outcome resolves the entry, scores the output outside any lock, applies
//! the observation under the template's own lock and appends the facts to
//! an ordered history log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bandit::BanditChoice;
use super::registry::TemplateRegistry;
use super::reward::RewardEvaluator;
use super::stats::ConfidenceModel;
use super::types::{
    Algorithm, CandidateSource, PerformanceRecord, PromptTemplate, RewardComponents,
    SelectionReason, SelectionRecord, SelectionToken, StatsDelta, SynthesisContext,
    TemplateStats,
};
use crate::error::{Error, Result};

/// A selection awaiting its outcome
#[derive(Debug, Clone)]
pub struct PendingSelection {
    pub token: SelectionToken,
    pub template_hash: String,
    pub choice: BanditChoiceSummary,
    pub stats_at_selection: TemplateStats,
    pub context: Value,
    /// Times this token has been reported
    pub reports: u32,
}

/// Rationale of a bandit choice, without the template snapshot
#[derive(Debug, Clone)]
pub struct BanditChoiceSummary {
    pub algorithm: Algorithm,
    pub reason: SelectionReason,
    pub candidate_source: CandidateSource,
    pub candidates_considered: usize,
    pub is_exploration: bool,
}

impl From<&BanditChoice> for BanditChoiceSummary {
    fn from(choice: &BanditChoice) -> Self {
        Self {
            algorithm: choice.algorithm,
            reason: choice.reason.clone(),
            candidate_source: choice.candidate_source,
            candidates_considered: choice.candidates_considered,
            is_exploration: choice.is_exploration,
        }
    }
}

impl PendingSelection {
    /// Build the pending entry for a fresh selection
    pub fn new(token: SelectionToken, choice: &BanditChoice, context: &SynthesisContext) -> Self {
        Self {
            token,
            template_hash: choice.template.content_hash(),
            choice: BanditChoiceSummary::from(choice),
            stats_at_selection: choice.template.stats.clone(),
            context: context.to_value(),
            reports: 0,
        }
    }
}

/// Ledger size below which inserts never sweep for expired tokens
const PRUNE_FLOOR: usize = 1024;

#[derive(Debug)]
struct Ledger {
    entries: HashMap<Uuid, PendingSelection>,
    /// Size at which the next insert sweeps expired entries
    prune_at: usize,
}

/// Ledger of issued, not yet expired selection tokens
#[derive(Debug)]
pub struct PendingSelections {
    ttl: Duration,
    ledger: Mutex<Ledger>,
}

impl PendingSelections {
    /// Create a ledger whose entries live for `ttl_secs`
    pub fn new(ttl_secs: u64) -> Self {
        let ttl_secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000);
        Self {
            ttl: Duration::seconds(ttl_secs),
            ledger: Mutex::new(Ledger {
                entries: HashMap::new(),
                prune_at: PRUNE_FLOOR,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, pending: &PendingSelection, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(pending.token.issued_at) > self.ttl
    }

    /// Record a selection
    ///
    /// Expired entries are swept once the ledger doubles in size since the
    /// last sweep, so inserts stay amortised O(1).
    pub fn insert(&self, pending: PendingSelection) {
        let mut ledger = self.lock();
        if ledger.entries.len() >= ledger.prune_at {
            let removed = self.prune_locked(&mut ledger, Utc::now());
            debug!(removed = removed, live = ledger.entries.len(), "Pruned expired selection tokens");
        }
        ledger.entries.insert(pending.token.token_id, pending);
    }

    fn prune_locked(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> usize {
        let before = ledger.entries.len();
        ledger.entries.retain(|_, p| !self.is_expired(p, now));
        ledger.prune_at = (ledger.entries.len() * 2).max(PRUNE_FLOOR);
        before - ledger.entries.len()
    }

    /// Look up a live token and count the report
    ///
    /// Tokens stay valid until they expire, so a second report returns the
    /// same entry with `reports > 1`.
    pub fn redeem(&self, token_id: &Uuid, now: DateTime<Utc>) -> Option<PendingSelection> {
        let mut ledger = self.lock();
        let expired = ledger
            .entries
            .get(token_id)
            .is_some_and(|pending| self.is_expired(pending, now));
        if expired {
            ledger.entries.remove(token_id);
            return None;
        }

        let pending = ledger.entries.get_mut(token_id)?;
        pending.reports += 1;
        Some(pending.clone())
    }

    /// Number of entries held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct HistoryInner {
    last_sequence: u64,
    performance: VecDeque<PerformanceRecord>,
    selections: VecDeque<SelectionRecord>,
}

/// Append-only, totally ordered log of observations
///
/// An unbounded log keeps every record. A bounded log keeps only the most
/// recent ones, for when a store holds the full history.
#[derive(Debug, Default)]
pub struct HistoryLog {
    capacity: Option<usize>,
    inner: Mutex<HistoryInner>,
}

impl HistoryLog {
    /// Create an empty, unbounded log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log that keeps at most `capacity` recent records
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Continue numbering after a sequence restored from storage
    pub fn resume_after(&self, sequence: u64) {
        let mut inner = self.lock();
        inner.last_sequence = inner.last_sequence.max(sequence);
    }

    /// Append both facts of one observation under a single sequence number
    pub fn append(
        &self,
        pending: &PendingSelection,
        reward: RewardComponents,
        context: &SynthesisContext,
    ) -> (PerformanceRecord, SelectionRecord) {
        let mut inner = self.lock();
        inner.last_sequence += 1;
        let sequence = inner.last_sequence;
        // Timestamp taken under the lock so sequence and time agree
        let recorded_at = Utc::now();

        let performance = PerformanceRecord {
            id: Uuid::new_v4(),
            sequence,
            template_id: pending.token.template_id.clone(),
            session_id: pending.token.session_id.clone(),
            reward,
            context: context.to_value(),
            recorded_at,
        };
        let selection = SelectionRecord {
            id: Uuid::new_v4(),
            sequence,
            token_id: pending.token.token_id,
            template_id: pending.token.template_id.clone(),
            template_hash: pending.template_hash.clone(),
            session_id: pending.token.session_id.clone(),
            algorithm: pending.choice.algorithm,
            reason: pending.choice.reason.clone(),
            candidate_source: pending.choice.candidate_source,
            candidates_considered: pending.choice.candidates_considered,
            is_exploration: pending.choice.is_exploration,
            stats_at_selection: pending.stats_at_selection.clone(),
            context: pending.context.clone(),
            selected_at: pending.token.issued_at,
            outcome: reward,
            recorded_at,
        };

        inner.performance.push_back(performance.clone());
        inner.selections.push_back(selection.clone());
        if let Some(capacity) = self.capacity {
            while inner.performance.len() > capacity {
                inner.performance.pop_front();
                inner.selections.pop_front();
            }
        }
        (performance, selection)
    }

    /// Sequence of the most recent observation (0 when empty)
    pub fn last_sequence(&self) -> u64 {
        self.lock().last_sequence
    }

    /// Number of records held in memory
    pub fn len(&self) -> usize {
        self.lock().performance.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the performance records held, in sequence order
    pub fn performance(&self) -> Vec<PerformanceRecord> {
        self.lock().performance.iter().cloned().collect()
    }

    /// Copy of the selection records held, in sequence order
    pub fn selections(&self) -> Vec<SelectionRecord> {
        self.lock().selections.iter().cloned().collect()
    }

    /// Performance records of one template
    pub fn performance_for(&self, template_id: &str) -> Vec<PerformanceRecord> {
        self.lock()
            .performance
            .iter()
            .filter(|r| r.template_id == template_id)
            .cloned()
            .collect()
    }
}

/// Result of folding one outcome into the engine
#[derive(Debug, Clone)]
pub struct Observation {
    /// Template as it was after the update
    pub template: PromptTemplate,
    pub reward: RewardComponents,
    pub success: bool,
    /// False when the token had already been reported
    pub first_report: bool,
    pub performance: PerformanceRecord,
    pub selection: SelectionRecord,
}

/// Applies reported outcomes to the registry
#[derive(Debug)]
pub struct PerformanceTracker {
    evaluator: RewardEvaluator,
    model: ConfidenceModel,
    reward_threshold: f64,
    pending: PendingSelections,
    history: HistoryLog,
}

impl PerformanceTracker {
    /// Create a tracker
    pub fn new(
        evaluator: RewardEvaluator,
        model: ConfidenceModel,
        reward_threshold: f64,
        token_ttl_secs: u64,
    ) -> Self {
        Self {
            evaluator,
            model,
            reward_threshold,
            pending: PendingSelections::new(token_ttl_secs),
            history: HistoryLog::new(),
        }
    }

    /// Keep only the most recent `capacity` history records in memory
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = HistoryLog::bounded(capacity);
        self
    }

    /// Remember a selection so its outcome can be attributed later
    pub fn track(&self, pending: PendingSelection) {
        self.pending.insert(pending);
    }

    /// Pending-token ledger
    pub fn pending(&self) -> &PendingSelections {
        &self.pending
    }

    /// Ordered observation history
    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Confidence model used for interval updates
    pub fn model(&self) -> &ConfidenceModel {
        &self.model
    }

    /// Score an output and fold it into the chosen template's statistics
    ///
    /// Unknown or expired tokens fail with `TemplateNotFound` and change
    /// nothing.
    pub fn report_outcome(
        &self,
        registry: &TemplateRegistry,
        token: &SelectionToken,
        output: &str,
        context: &SynthesisContext,
    ) -> Result<Observation> {
        let pending = self
            .pending
            .redeem(&token.token_id, Utc::now())
            .ok_or_else(|| Error::TemplateNotFound(token.template_id.clone()))?;

        if pending.reports > 1 {
            warn!(
                token_id = %token.token_id,
                template_id = %pending.token.template_id,
                reports = pending.reports,
                "Selection token reported more than once; recording another observation"
            );
        }

        let template_id = pending.token.template_id.as_str();
        let template = registry.get(template_id)?;

        let reward = self.evaluator.score(&template, output, context);
        let delta = StatsDelta::from_reward(reward.composite_score, self.reward_threshold);
        let success = delta.success;

        let updated = registry.apply_update(template_id, &delta, &self.model)?;
        let (performance, selection) = self.history.append(&pending, reward, context);

        debug!(
            template_id = %template_id,
            sequence = performance.sequence,
            reward = reward.composite_score,
            success = success,
            total_uses = updated.stats.total_uses,
            average_reward = updated.stats.average_reward,
            "Recorded prompt outcome"
        );

        Ok(Observation {
            template: updated,
            reward,
            success,
            first_report: pending.reports == 1,
            performance,
            selection,
        })
    }
}
