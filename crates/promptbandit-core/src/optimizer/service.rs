//! The prompt optimizer service
//!
//! Owns the registry, selector, tracker, sessions and metrics, and writes
//! behind to an optional [`OptimizerStore`]. Construct one and share it by
//! reference (or `Arc`) between tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bandit::BanditSelector;
use super::metrics::{MetricsExporter, MetricsSnapshot, OptimizerMetrics, TemplateSummary};
use super::registry::TemplateRegistry;
use super::reward::RewardEvaluator;
use super::seed::default_templates;
use super::session::{DEFAULT_SESSION_ID, Session, SessionManager};
use super::stats::ConfidenceModel;
use super::store::OptimizerStore;
use super::tracker::{Observation, PendingSelection, PerformanceTracker};
use super::types::{
    MabConfig, PerformanceRecord, PromptTemplate, RewardComponents, SelectionToken,
    SynthesisContext, TemplateHandle, TemplateStats,
};
use crate::error::{Error, Result};
use crate::llm::{GenerationParams, TextGenerator};

/// History records kept in memory when a store holds the full history
const HISTORY_TAIL: usize = 1024;

/// Result of one select -> generate -> report cycle
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub template: TemplateHandle,
    pub token: SelectionToken,
    /// Generated text; empty when generation failed or timed out
    pub output: String,
    pub reward: RewardComponents,
    /// Why generation produced no output, if it didn't
    pub generation_error: Option<String>,
}

/// Builder for creating a PromptOptimizer
#[derive(Default)]
pub struct PromptOptimizerBuilder {
    config: Option<MabConfig>,
    store: Option<Arc<dyn OptimizerStore>>,
    seed: Option<u64>,
}

impl PromptOptimizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: MabConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Persist templates, history and sessions to this store
    pub fn store(mut self, store: Arc<dyn OptimizerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fix the selector's RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<PromptOptimizer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let evaluator = RewardEvaluator::new(config.reward_weights)?;
        let model = ConfidenceModel::from_config(&config);
        let selector = match self.seed {
            Some(seed) => BanditSelector::with_seed(&config, seed),
            None => BanditSelector::new(&config),
        };
        let mut tracker = PerformanceTracker::new(
            evaluator,
            model,
            config.reward_threshold,
            config.token_ttl_secs,
        );
        if self.store.is_some() {
            tracker = tracker.with_history_capacity(HISTORY_TAIL);
        }
        let sessions = SessionManager::new(
            config.algorithm,
            config.convergence_window,
            config.min_uses_for_confidence,
        );

        info!(
            algorithm = %config.algorithm,
            persistent = self.store.is_some(),
            "Prompt optimizer created"
        );

        Ok(PromptOptimizer {
            config,
            registry: TemplateRegistry::new(),
            selector,
            tracker,
            sessions,
            metrics: OptimizerMetrics::new(),
            store: self.store,
            activation: Mutex::new(()),
        })
    }
}

/// Multi-armed bandit prompt optimizer
pub struct PromptOptimizer {
    config: MabConfig,
    registry: TemplateRegistry,
    selector: BanditSelector,
    tracker: PerformanceTracker,
    sessions: SessionManager,
    metrics: OptimizerMetrics,
    store: Option<Arc<dyn OptimizerStore>>,
    /// Orders activation changes with their writes to the store
    activation: Mutex<()>,
}

impl std::fmt::Debug for PromptOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptOptimizer")
            .field("algorithm", &self.config.algorithm)
            .field("templates", &self.registry.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl PromptOptimizer {
    /// In-memory optimizer with the given configuration
    pub fn new(config: MabConfig) -> Result<Self> {
        PromptOptimizerBuilder::new().config(config).build()
    }

    pub fn builder() -> PromptOptimizerBuilder {
        PromptOptimizerBuilder::new()
    }

    pub fn config(&self) -> &MabConfig {
        &self.config
    }

    /// Load persisted state, seeding the built-in templates when there is none
    ///
    /// Without a store only the seeding happens. Returns the number of
    /// registered templates afterwards.
    pub async fn bootstrap(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            if self.registry.is_empty() {
                for template in default_templates() {
                    self.register_in_memory(template)?;
                }
            }
            return Ok(self.registry.len());
        };

        let persisted = store.load_templates().await?;
        if persisted.is_empty() {
            let seeds = default_templates();
            for template in &seeds {
                if !self.registry.contains(&template.id) {
                    self.register_in_memory(template.clone())?;
                }
            }
            store.save_templates(&seeds).await?;
            info!(count = seeds.len(), "Seeded default prompt templates");
        } else {
            let persisted = self.reconcile(store.as_ref(), persisted).await?;
            for template in persisted {
                self.metrics.track_template(&template);
                self.registry.restore(template);
            }
        }

        for session in store.load_sessions().await? {
            self.sessions.restore(session);
        }

        let last_sequence = store.last_sequence().await?;
        self.tracker.history().resume_after(last_sequence);

        info!(
            templates = self.registry.len(),
            last_sequence = last_sequence,
            "Prompt optimizer bootstrapped"
        );
        Ok(self.registry.len())
    }

    /// Bring stored statistics level with the stored history
    ///
    /// Statistics are written every `update_frequency` uses, so after an
    /// exit without `flush()` they can lag the history. Lagging templates
    /// are rebuilt from their performance records and written back.
    async fn reconcile(
        &self,
        store: &dyn OptimizerStore,
        mut templates: Vec<PromptTemplate>,
    ) -> Result<Vec<PromptTemplate>> {
        let counts = store.performance_counts().await?;
        let mut rebuilt = Vec::new();

        for template in &mut templates {
            let recorded = counts.get(&template.id).copied().unwrap_or(0);
            if recorded > template.stats.total_uses {
                let records = store.load_performance(Some(&template.id)).await?;
                let stats = TemplateStats::replay(
                    &records,
                    self.config.reward_threshold,
                    self.tracker.model(),
                );
                warn!(
                    template_id = %template.id,
                    stored_uses = template.stats.total_uses,
                    recorded = recorded,
                    "Rebuilt template statistics from history"
                );
                template.stats = stats;
                rebuilt.push(template.clone());
            } else if recorded < template.stats.total_uses {
                warn!(
                    template_id = %template.id,
                    stored_uses = template.stats.total_uses,
                    recorded = recorded,
                    "Template statistics are ahead of the stored history"
                );
            }
        }

        store.save_template_stats(&rebuilt).await?;
        Ok(templates)
    }

    fn register_in_memory(&self, template: PromptTemplate) -> Result<()> {
        self.metrics.track_template(&template);
        self.registry.register(template)
    }

    /// Add a template; ids are immutable and may not be reused
    pub async fn register_prompt_template(&self, template: PromptTemplate) -> Result<()> {
        self.registry.register(template.clone())?;
        self.metrics.track_template(&template);
        info!(template_id = %template.id, category = %template.category, "Registered prompt template");

        if let Some(store) = &self.store {
            if let Err(e) = store.save_template(&template).await {
                warn!(template_id = %template.id, error = %e, "Failed to persist template");
            }
        }
        Ok(())
    }

    /// Pick a template for the context and issue a token for its outcome
    pub fn select_optimal_prompt(
        &self,
        context: &SynthesisContext,
    ) -> Result<(TemplateHandle, SelectionToken)> {
        let session_id = context.session_id().unwrap_or(DEFAULT_SESSION_ID);
        let choice = self.selector.select(&self.registry, context)?;

        let token = SelectionToken::issue(&choice.template.id, session_id);
        self.tracker
            .track(PendingSelection::new(token.clone(), &choice, context));

        Ok((TemplateHandle::from(&choice.template), token))
    }

    /// Score an output and fold it into the selected template's statistics
    ///
    /// The session counts the selection here, on its first report, so that
    /// selecting alone leaves every metric untouched.
    pub async fn report_outcome(
        &self,
        token: &SelectionToken,
        output: &str,
        context: &SynthesisContext,
    ) -> Result<RewardComponents> {
        let observation = self
            .tracker
            .report_outcome(&self.registry, token, output, context)?;
        self.metrics.record_observation(&observation.template);

        let session_id = observation.performance.session_id.as_str();
        if observation.first_report {
            self.sessions
                .record_selection(session_id, observation.selection.is_exploration);
        }
        let active = self.registry.list_active(None);
        let session = self.sessions.record_observation(
            session_id,
            &observation.template.id,
            observation.reward.composite_score,
            &active,
        );

        self.persist_observation(&observation, &session).await;
        Ok(observation.reward)
    }

    async fn persist_observation(&self, observation: &Observation, session: &Session) {
        let Some(store) = &self.store else {
            return;
        };
        let template = &observation.template;

        if let Err(e) = store.append_performance(&observation.performance).await {
            warn!(template_id = %template.id, error = %e, "Failed to persist performance record");
        }
        if let Err(e) = store.append_selection(&observation.selection).await {
            warn!(template_id = %template.id, error = %e, "Failed to persist selection record");
        }
        if template.stats.total_uses % self.config.update_frequency == 0 {
            match store.save_template_stats(std::slice::from_ref(template)).await {
                Ok(()) => debug!(template_id = %template.id, uses = template.stats.total_uses, "Persisted template statistics"),
                Err(e) => warn!(template_id = %template.id, error = %e, "Failed to persist template statistics"),
            }
        }
        if let Err(e) = store.save_session(session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }

    /// One full cycle: select, generate, report
    ///
    /// Generation failures and timeouts are scored as an empty output, so
    /// they still count as a use of the template.
    pub async fn synthesize(
        &self,
        generator: &dyn TextGenerator,
        context: &SynthesisContext,
        params: &GenerationParams,
    ) -> Result<SynthesisOutcome> {
        let (template, token) = self.select_optimal_prompt(context)?;
        let prompt = template.fill(context);

        let timeout = Duration::from_secs(params.timeout_secs);
        let (output, generation_error) =
            match tokio::time::timeout(timeout, generator.generate(&prompt, params)).await {
                Ok(Ok(output)) => (output, None),
                Ok(Err(e)) => {
                    warn!(template_id = %template.id, generator = generator.name(), error = %e, "Generation failed");
                    (String::new(), Some(e.to_string()))
                }
                Err(_) => {
                    warn!(template_id = %template.id, generator = generator.name(), timeout_secs = params.timeout_secs, "Generation timed out");
                    (
                        String::new(),
                        Some(Error::GenerationTimeout(params.timeout_secs).to_string()),
                    )
                }
            };

        let reward = self.report_outcome(&token, &output, context).await?;
        Ok(SynthesisOutcome {
            template,
            token,
            output,
            reward,
            generation_error,
        })
    }

    /// Current metrics; repeated calls without reports compare equal
    pub fn get_optimization_metrics(&self) -> MetricsSnapshot {
        MetricsExporter::snapshot(
            self.selector.algorithm(),
            self.metrics.total_optimizations(),
            &self.registry.list_all(),
            &self.sessions.sessions(),
            self.tracker.history().last_sequence(),
        )
    }

    pub fn get_best_performing_templates(&self, top_k: usize) -> Vec<TemplateSummary> {
        MetricsExporter::best_performing(&self.registry.list_all(), top_k)
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> Result<String> {
        self.metrics.render(&self.registry.list_all())
    }

    pub fn template(&self, id: &str) -> Result<PromptTemplate> {
        self.registry.get(id)
    }

    /// Every registered template, sorted by id
    pub fn templates(&self) -> Vec<PromptTemplate> {
        self.registry.list_all()
    }

    pub async fn deactivate_template(&self, id: &str) -> Result<PromptTemplate> {
        let _guard = self.activation.lock().await;
        let template = self.registry.deactivate(id)?;
        info!(template_id = %id, "Deactivated prompt template");
        self.persist_template(&template).await;
        Ok(template)
    }

    pub async fn activate_template(&self, id: &str) -> Result<PromptTemplate> {
        let _guard = self.activation.lock().await;
        let template = self.registry.activate(id)?;
        info!(template_id = %id, "Activated prompt template");
        self.persist_template(&template).await;
        Ok(template)
    }

    async fn persist_template(&self, template: &PromptTemplate) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_template(template).await {
                warn!(template_id = %template.id, error = %e, "Failed to persist template");
            }
        }
    }

    pub async fn start_session(&self, name: &str) -> Session {
        let session = self.sessions.start_session(name);
        self.persist_session(&session).await;
        session
    }

    pub async fn end_session(&self, id: &str) -> Result<Session> {
        let session = self.sessions.end_session(id)?;
        self.persist_session(&session).await;
        Ok(session)
    }

    async fn persist_session(&self, session: &Session) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(session).await {
                warn!(session_id = %session.id, error = %e, "Failed to persist session");
            }
        }
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.sessions.session(id)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.sessions()
    }

    /// Performance records in sequence order, optionally for one template
    ///
    /// Reads the store when there is one; otherwise the records observed by
    /// this process.
    pub async fn performance_history(
        &self,
        template_id: Option<&str>,
    ) -> Result<Vec<PerformanceRecord>> {
        if let Some(store) = &self.store {
            return store.load_performance(template_id).await;
        }
        Ok(match template_id {
            Some(id) => self.tracker.history().performance_for(id),
            None => self.tracker.history().performance(),
        })
    }

    /// Tokens issued but not yet reported or expired
    pub fn pending_selections(&self) -> usize {
        self.tracker.pending().len()
    }

    /// Write every template's statistics and every session to the store
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let templates = self.registry.list_all();
        store.save_template_stats(&templates).await?;
        for session in self.sessions.sessions() {
            store.save_session(&session).await?;
        }
        debug!(templates = templates.len(), "Flushed optimizer state");
        Ok(())
    }

    /// Export history as JSON lines into `dir`
    ///
    /// Reads from the store when there is one, so history from earlier runs
    /// is included.
    pub async fn export_history(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let (performance, selections) = match &self.store {
            Some(store) => (
                store.load_performance(None).await?,
                store.load_selections().await?,
            ),
            None => (
                self.tracker.history().performance(),
                self.tracker.history().selections(),
            ),
        };
        MetricsExporter::export_history_jsonl(dir, &performance, &selections)
    }
}
