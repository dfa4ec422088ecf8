//! Read-only views over the optimizer: snapshots, rankings, exports and
//! Prometheus exposition

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::session::Session;
use super::types::{Algorithm, PerformanceRecord, PromptTemplate, SelectionRecord};
use crate::error::{Error, Result};

/// Per-template line of a metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: String,
    pub is_active: bool,
    pub total_uses: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub average_reward: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub expected_performance: f64,
}

impl From<&PromptTemplate> for TemplateSummary {
    fn from(template: &PromptTemplate) -> Self {
        Self {
            id: template.id.clone(),
            name: template.name.clone(),
            category: template.category.clone(),
            version: template.version.clone(),
            is_active: template.is_active,
            total_uses: template.stats.total_uses,
            success_count: template.stats.success_count,
            success_rate: template.stats.success_rate(),
            average_reward: template.stats.average_reward,
            confidence_lower: template.stats.confidence_lower,
            confidence_upper: template.stats.confidence_upper,
            expected_performance: template.expected_performance,
        }
    }
}

/// Per-session line of a metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub total_selections: u64,
    pub total_observations: u64,
    pub average_reward: f64,
    pub best_template_id: Option<String>,
    pub best_template_reward: f64,
    pub exploration_rate: f64,
    pub convergence_achieved: bool,
    pub convergence_iteration: Option<u64>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            is_active: session.is_active,
            total_selections: session.total_selections,
            total_observations: session.total_observations,
            average_reward: session.average_reward,
            best_template_id: session.best_template_id.clone(),
            best_template_reward: session.best_template_reward,
            exploration_rate: session.exploration_rate,
            convergence_achieved: session.convergence_achieved,
            convergence_iteration: session.convergence_iteration,
        }
    }
}

/// Point-in-time view of the whole optimizer
///
/// Carries no wall-clock fields, so two snapshots with no report in between
/// compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub algorithm: Algorithm,
    /// Completed select -> report cycles
    pub total_optimizations: u64,
    pub total_template_uses: u64,
    pub total_successes: u64,
    pub overall_success_rate: f64,
    pub active_templates: usize,
    pub registered_templates: usize,
    /// Sorted by template id
    pub templates: Vec<TemplateSummary>,
    pub sessions: Vec<SessionSummary>,
    /// Sequence of the latest history record
    pub last_sequence: u64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TemplateLabel {
    pub template_id: String,
}

/// Prometheus instruments for the optimizer
pub struct OptimizerMetrics {
    registry: Registry,
    total_optimizations: Counter,
    template_uses: Family<TemplateLabel, Counter>,
    template_average_reward: Family<TemplateLabel, Gauge<f64, AtomicU64>>,
    overall_success_rate: Gauge<f64, AtomicU64>,
}

impl std::fmt::Debug for OptimizerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerMetrics")
            .field("total_optimizations", &self.total_optimizations.get())
            .finish_non_exhaustive()
    }
}

impl Default for OptimizerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let total_optimizations: Counter = Counter::default();
        registry.register(
            "mab_total_optimizations",
            "Completed prompt selection and outcome report cycles",
            total_optimizations.clone(),
        );

        let template_uses: Family<TemplateLabel, Counter> = Family::default();
        registry.register(
            "mab_template_uses",
            "Reported outcomes per prompt template",
            template_uses.clone(),
        );

        let template_average_reward: Family<TemplateLabel, Gauge<f64, AtomicU64>> =
            Family::default();
        registry.register(
            "mab_template_average_reward",
            "Mean composite reward per prompt template",
            template_average_reward.clone(),
        );

        let overall_success_rate: Gauge<f64, AtomicU64> = Gauge::default();
        registry.register(
            "mab_overall_success_rate",
            "Successful outcomes over all template uses",
            overall_success_rate.clone(),
        );

        Self {
            registry,
            total_optimizations,
            template_uses,
            template_average_reward,
            overall_success_rate,
        }
    }

    fn label(template_id: &str) -> TemplateLabel {
        TemplateLabel {
            template_id: template_id.to_string(),
        }
    }

    /// Account for a template's existing history (registration or restore)
    pub fn track_template(&self, template: &PromptTemplate) {
        let label = Self::label(&template.id);
        self.template_uses
            .get_or_create(&label)
            .inc_by(template.stats.total_uses);
        self.template_average_reward
            .get_or_create(&label)
            .set(template.stats.average_reward);
        self.total_optimizations.inc_by(template.stats.total_uses);
    }

    /// Account for one completed report
    pub fn record_observation(&self, template: &PromptTemplate) {
        let label = Self::label(&template.id);
        self.total_optimizations.inc();
        self.template_uses.get_or_create(&label).inc();
        self.template_average_reward
            .get_or_create(&label)
            .set(template.stats.average_reward);
    }

    /// Completed cycles so far
    pub fn total_optimizations(&self) -> u64 {
        self.total_optimizations.get()
    }

    /// Text exposition; the success-rate gauge is refreshed first
    pub fn render(&self, templates: &[PromptTemplate]) -> Result<String> {
        self.overall_success_rate.set(overall_success_rate(templates));
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| Error::Other(format!("Failed to encode metrics: {}", e)))?;
        Ok(buffer)
    }
}

fn overall_success_rate(templates: &[PromptTemplate]) -> f64 {
    let uses: u64 = templates.iter().map(|t| t.stats.total_uses).sum();
    let successes: u64 = templates.iter().map(|t| t.stats.success_count).sum();
    if uses == 0 {
        0.0
    } else {
        successes as f64 / uses as f64
    }
}

/// Builds snapshots and rankings from registry copies
pub struct MetricsExporter;

impl MetricsExporter {
    /// Assemble a snapshot; `templates` may be in any order
    pub fn snapshot(
        algorithm: Algorithm,
        total_optimizations: u64,
        templates: &[PromptTemplate],
        sessions: &[Session],
        last_sequence: u64,
    ) -> MetricsSnapshot {
        let mut summaries: Vec<TemplateSummary> =
            templates.iter().map(TemplateSummary::from).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        MetricsSnapshot {
            algorithm,
            total_optimizations,
            total_template_uses: templates.iter().map(|t| t.stats.total_uses).sum(),
            total_successes: templates.iter().map(|t| t.stats.success_count).sum(),
            overall_success_rate: overall_success_rate(templates),
            active_templates: templates.iter().filter(|t| t.is_active).count(),
            registered_templates: templates.len(),
            templates: summaries,
            sessions: sessions.iter().map(SessionSummary::from).collect(),
            last_sequence,
        }
    }

    /// Top templates by mean reward, then uses, then id
    pub fn best_performing(templates: &[PromptTemplate], top_k: usize) -> Vec<TemplateSummary> {
        let mut ranked: Vec<&PromptTemplate> = templates.iter().collect();
        ranked.sort_by(|a, b| {
            b.stats
                .average_reward
                .total_cmp(&a.stats.average_reward)
                .then_with(|| b.stats.total_uses.cmp(&a.stats.total_uses))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
            .into_iter()
            .take(top_k)
            .map(TemplateSummary::from)
            .collect()
    }

    /// Write `performance.jsonl` and `selections.jsonl` into `dir`
    pub fn export_history_jsonl(
        dir: &Path,
        performance: &[PerformanceRecord],
        selections: &[SelectionRecord],
    ) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;

        let performance_path = dir.join("performance.jsonl");
        write_jsonl(&performance_path, performance)?;

        let selections_path = dir.join("selections.jsonl");
        write_jsonl(&selections_path, selections)?;

        info!(
            dir = %dir.display(),
            performance = performance.len(),
            selections = selections.len(),
            "Exported optimization history"
        );
        Ok((performance_path, selections_path))
    }
}

fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
