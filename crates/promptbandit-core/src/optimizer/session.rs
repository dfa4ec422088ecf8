//! Optimization sessions and convergence detection

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::stats::intervals_overlap;
use super::types::{Algorithm, PromptTemplate};
use crate::error::{Error, Result};

/// Id of the session that exists from construction
pub const DEFAULT_SESSION_ID: &str = "default";

/// Per-template tally inside one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTally {
    pub uses: u64,
    pub total_reward: f64,
}

impl SessionTally {
    pub fn average(&self) -> f64 {
        if self.uses == 0 {
            0.0
        } else {
            self.total_reward / self.uses as f64
        }
    }
}

/// A bounded optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub algorithm: Algorithm,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Selections whose outcome has been reported
    pub total_selections: u64,
    pub total_observations: u64,
    pub total_reward: f64,
    pub average_reward: f64,
    pub best_template_id: Option<String>,
    pub best_template_reward: f64,
    pub exploration_selections: u64,
    /// Realised share of exploratory selections
    pub exploration_rate: f64,
    pub convergence_achieved: bool,
    /// Session observation index at which convergence first held
    pub convergence_iteration: Option<u64>,
    pub template_rewards: BTreeMap<String, SessionTally>,
}

impl Session {
    /// Start a new session
    pub fn new(id: impl Into<String>, name: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            algorithm,
            started_at: Utc::now(),
            ended_at: None,
            is_active: true,
            total_selections: 0,
            total_observations: 0,
            total_reward: 0.0,
            average_reward: 0.0,
            best_template_id: None,
            best_template_reward: 0.0,
            exploration_selections: 0,
            exploration_rate: 0.0,
            convergence_achieved: false,
            convergence_iteration: None,
            template_rewards: BTreeMap::new(),
        }
    }

    fn record_selection(&mut self, is_exploration: bool) {
        self.total_selections += 1;
        if is_exploration {
            self.exploration_selections += 1;
        }
        self.exploration_rate = self.exploration_selections as f64 / self.total_selections as f64;
    }

    fn record_observation(&mut self, template_id: &str, reward: f64) {
        self.total_observations += 1;
        self.total_reward += reward;
        self.average_reward = self.total_reward / self.total_observations as f64;

        let tally = self.template_rewards.entry(template_id.to_string()).or_default();
        tally.uses += 1;
        tally.total_reward += reward;

        // BTreeMap order makes the lower id win ties
        let mut best: Option<(&String, f64)> = None;
        for (id, tally) in &self.template_rewards {
            let average = tally.average();
            if best.is_none_or(|(_, top)| average > top) {
                best = Some((id, average));
            }
        }
        if let Some((id, average)) = best {
            self.best_template_id = Some(id.clone());
            self.best_template_reward = average;
        }
    }

    fn end(&mut self) {
        self.is_active = false;
        self.ended_at = Some(Utc::now());
    }
}

/// Watches the leading template over a rolling window of observations
#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    window: usize,
    min_uses: u64,
    leaders: VecDeque<Option<String>>,
}

impl ConvergenceDetector {
    pub fn new(window: usize, min_uses: u64) -> Self {
        Self {
            window: window.max(1),
            min_uses,
            leaders: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Record the leader after one observation and report whether the run
    /// has converged
    ///
    /// Converged means the same qualifying leader for the whole window and a
    /// confidence interval disjoint from the runner-up's. With no runner-up
    /// the leader must be the only active template.
    pub fn observe(&mut self, active: &[PromptTemplate]) -> bool {
        let mut qualifying: Vec<&PromptTemplate> = active
            .iter()
            .filter(|t| t.stats.total_uses > 0 && t.stats.total_uses >= self.min_uses)
            .collect();
        qualifying.sort_by(|a, b| {
            b.stats
                .average_reward
                .total_cmp(&a.stats.average_reward)
                .then_with(|| a.id.cmp(&b.id))
        });

        if self.leaders.len() == self.window {
            self.leaders.pop_front();
        }
        self.leaders.push_back(qualifying.first().map(|t| t.id.clone()));

        let Some(leader) = qualifying.first() else {
            return false;
        };
        let stable = self.leaders.len() == self.window
            && self
                .leaders
                .iter()
                .all(|id| id.as_deref() == Some(leader.id.as_str()));
        if !stable {
            return false;
        }

        match qualifying.get(1) {
            Some(runner_up) => !intervals_overlap(
                (leader.stats.confidence_lower, leader.stats.confidence_upper),
                (runner_up.stats.confidence_lower, runner_up.stats.confidence_upper),
            ),
            None => active.len() == 1,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    detector: ConvergenceDetector,
}

/// Owns every session and its convergence detector
#[derive(Debug)]
pub struct SessionManager {
    algorithm: Algorithm,
    window: usize,
    min_uses: u64,
    sessions: Mutex<BTreeMap<String, SessionEntry>>,
}

impl SessionManager {
    /// Create a manager holding the default session
    pub fn new(algorithm: Algorithm, window: usize, min_uses: u64) -> Self {
        let manager = Self {
            algorithm,
            window,
            min_uses,
            sessions: Mutex::new(BTreeMap::new()),
        };
        manager.ensure(DEFAULT_SESSION_ID);
        manager
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, session: Session) -> SessionEntry {
        SessionEntry {
            session,
            detector: ConvergenceDetector::new(self.window, self.min_uses),
        }
    }

    /// Start a named session with a fresh id
    pub fn start_session(&self, name: &str) -> Session {
        let session = Session::new(Uuid::new_v4().to_string(), name, self.algorithm);
        info!(session_id = %session.id, name = %name, "Started optimization session");
        self.lock()
            .insert(session.id.clone(), self.entry(session.clone()));
        session
    }

    /// Session by id, starting it if the id is new
    pub fn ensure(&self, id: &str) -> Session {
        let mut sessions = self.lock();
        if let Some(entry) = sessions.get(id) {
            return entry.session.clone();
        }
        let session = Session::new(id, id, self.algorithm);
        sessions.insert(id.to_string(), self.entry(session.clone()));
        session
    }

    /// Bring back a persisted session
    pub fn restore(&self, session: Session) {
        self.lock().insert(session.id.clone(), self.entry(session));
    }

    /// Close a session; it stays queryable
    pub fn end_session(&self, id: &str) -> Result<Session> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        entry.session.end();
        info!(
            session_id = %id,
            observations = entry.session.total_observations,
            converged = entry.session.convergence_achieved,
            "Ended optimization session"
        );
        Ok(entry.session.clone())
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.lock().get(id).map(|e| e.session.clone())
    }

    /// Every session, ordered by id
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().values().map(|e| e.session.clone()).collect()
    }

    /// Count a reported selection made on behalf of a session
    pub fn record_selection(&self, id: &str, is_exploration: bool) {
        self.ensure(id);
        if let Some(entry) = self.lock().get_mut(id) {
            entry.session.record_selection(is_exploration);
        }
    }

    /// Fold an observation into a session and check convergence
    ///
    /// `active` is a snapshot of the active templates taken after the
    /// observation was applied.
    pub fn record_observation(
        &self,
        id: &str,
        template_id: &str,
        reward: f64,
        active: &[PromptTemplate],
    ) -> Session {
        let mut sessions = self.lock();
        let entry = sessions
            .entry(id.to_string())
            .or_insert_with(|| self.entry(Session::new(id, id, self.algorithm)));

        entry.session.record_observation(template_id, reward);
        let converged = entry.detector.observe(active);
        if converged && !entry.session.convergence_achieved {
            entry.session.convergence_achieved = true;
            entry.session.convergence_iteration = Some(entry.session.total_observations);
            info!(
                session_id = %id,
                iteration = entry.session.total_observations,
                best_template = ?entry.session.best_template_id,
                "Optimization session converged"
            );
        }
        entry.session.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::stats::ConfidenceModel;
    use crate::optimizer::types::{MabConfig, StatsDelta};

    fn with_rewards(id: &str, rewards: &[f64], model: &ConfidenceModel) -> PromptTemplate {
        let mut template = PromptTemplate::new(id, id, "{requirements}", "adaptive");
        for &reward in rewards {
            template.stats.record(&StatsDelta::from_reward(reward, 0.8), model);
        }
        template
    }

    #[test]
    fn test_default_session_exists() {
        let manager = SessionManager::new(Algorithm::ThompsonSampling, 10, 5);
        let session = manager.session(DEFAULT_SESSION_ID).unwrap();
        assert!(session.is_active);
        assert_eq!(manager.sessions().len(), 1);
    }

    #[test]
    fn test_end_unknown_session() {
        let manager = SessionManager::new(Algorithm::Ucb1, 10, 5);
        assert!(matches!(
            manager.end_session("nope"),
            Err(Error::SessionNotFound(_))
        ));

        let started = manager.start_session("nightly");
        let ended = manager.end_session(&started.id).unwrap();
        assert!(!ended.is_active);
        assert!(ended.ended_at.is_some());
    }

    #[test]
    fn test_session_tracks_best_template_and_exploration() {
        let manager = SessionManager::new(Algorithm::EpsilonGreedy, 10, 5);
        manager.record_selection("run", true);
        manager.record_selection("run", false);
        manager.record_observation("run", "b", 0.4, &[]);
        manager.record_observation("run", "a", 0.9, &[]);
        let session = manager.record_observation("run", "a", 0.7, &[]);

        assert_eq!(session.total_selections, 2);
        assert!((session.exploration_rate - 0.5).abs() < 1e-12);
        assert_eq!(session.total_observations, 3);
        assert_eq!(session.best_template_id.as_deref(), Some("a"));
        assert!((session.best_template_reward - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_separated_leader_converges_after_window() {
        let model = ConfidenceModel::from_config(&MabConfig::default());
        let a = with_rewards("a", &[0.9; 50], &model);
        let b = with_rewards("b", &[0.5; 50], &model);
        let active = vec![a, b];

        let mut detector = ConvergenceDetector::new(3, 5);
        assert!(!detector.observe(&active));
        assert!(!detector.observe(&active));
        assert!(detector.observe(&active));
    }

    #[test]
    fn test_overlapping_intervals_do_not_converge() {
        let model = ConfidenceModel::from_config(&MabConfig::default());
        let a = with_rewards("a", &[0.6; 6], &model);
        let b = with_rewards("b", &[0.5; 6], &model);
        let active = vec![a, b];

        let mut detector = ConvergenceDetector::new(2, 5);
        for _ in 0..5 {
            assert!(!detector.observe(&active));
        }
    }

    #[test]
    fn test_lone_qualifier_needs_to_be_only_template() {
        let model = ConfidenceModel::from_config(&MabConfig::default());
        let a = with_rewards("a", &[0.9; 10], &model);
        let b = with_rewards("b", &[0.1; 2], &model);

        let mut detector = ConvergenceDetector::new(1, 5);
        assert!(!detector.observe(&[a.clone(), b]));
        assert!(detector.observe(&[a]));
    }

    #[test]
    fn test_convergence_latches() {
        let model = ConfidenceModel::from_config(&MabConfig::default());
        let a = with_rewards("a", &[0.9; 10], &model);
        let manager = SessionManager::new(Algorithm::ThompsonSampling, 2, 5);

        manager.record_observation(DEFAULT_SESSION_ID, "a", 0.9, std::slice::from_ref(&a));
        let session = manager.record_observation(DEFAULT_SESSION_ID, "a", 0.9, std::slice::from_ref(&a));
        assert!(session.convergence_achieved);
        assert_eq!(session.convergence_iteration, Some(2));

        let session = manager.record_observation(DEFAULT_SESSION_ID, "a", 0.9, &[]);
        assert!(session.convergence_achieved);
        assert_eq!(session.convergence_iteration, Some(2));
    }
}
