//! Template registry - the single source of truth for templates and stats
//!
//! Structural changes (register, activate, deactivate) take the map's write
//! lock. Statistics live behind a per-template mutex so that observations
//! for different templates never contend. Readers always receive copies.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info};

use super::stats::ConfidenceModel;
use super::types::{PromptTemplate, StatsDelta};
use crate::error::{Error, Result};

type Slot = Arc<Mutex<PromptTemplate>>;

/// In-memory catalogue of prompt templates
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<BTreeMap<String, Slot>>,
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, PromptTemplate> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new template; ids are unique and immutable
    pub fn register(&self, template: PromptTemplate) -> Result<()> {
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);

        if templates.contains_key(&template.id) {
            return Err(Error::DuplicateTemplate(template.id));
        }

        info!(
            template_id = %template.id,
            category = %template.category,
            version = %template.version,
            "Registered prompt template"
        );
        templates.insert(template.id.clone(), Arc::new(Mutex::new(template)));
        Ok(())
    }

    /// Insert or replace a template loaded from storage, keeping its stats
    pub fn restore(&self, template: PromptTemplate) {
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        debug!(template_id = %template.id, uses = template.stats.total_uses, "Restored template");
        templates.insert(template.id.clone(), Arc::new(Mutex::new(template)));
    }

    /// Copy of a template
    pub fn get(&self, id: &str) -> Result<PromptTemplate> {
        let slot = self.slot(id)?;
        let template = lock_slot(&slot).clone();
        Ok(template)
    }

    /// Whether a template id is registered
    pub fn contains(&self, id: &str) -> bool {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Snapshot of active templates sorted by id, optionally by category
    pub fn list_active(&self, category: Option<&str>) -> Vec<PromptTemplate> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        templates
            .values()
            .map(|slot| lock_slot(slot).clone())
            .filter(|t| t.is_active)
            .filter(|t| category.is_none_or(|c| t.category == c))
            .collect()
    }

    /// Snapshot of every template, including inactive ones
    pub fn list_all(&self) -> Vec<PromptTemplate> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        templates.values().map(|slot| lock_slot(slot).clone()).collect()
    }

    /// Number of registered templates
    pub fn len(&self) -> usize {
        self.templates.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no templates are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop selecting a template; its history is kept
    pub fn deactivate(&self, id: &str) -> Result<PromptTemplate> {
        self.set_active(id, false)
    }

    /// Make a deactivated template selectable again
    pub fn activate(&self, id: &str) -> Result<PromptTemplate> {
        self.set_active(id, true)
    }

    fn set_active(&self, id: &str, active: bool) -> Result<PromptTemplate> {
        // Hold the write lock so an in-flight snapshot sees the old or new list, never a mix
        let templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        let slot = templates
            .get(id)
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))?;
        let mut template = lock_slot(slot);
        template.is_active = active;
        info!(template_id = %id, active = active, "Changed template activation");
        Ok(template.clone())
    }

    /// Apply one observation to one template's statistics
    ///
    /// Only that template's lock is held while the stats change. The returned
    /// copy is taken under the same lock, so its activation flag and stats
    /// belong to one moment.
    pub fn apply_update(
        &self,
        id: &str,
        delta: &StatsDelta,
        model: &ConfidenceModel,
    ) -> Result<PromptTemplate> {
        let slot = self.slot(id)?;
        let mut template = lock_slot(&slot);
        template.stats.record(delta, model);
        Ok(template.clone())
    }

    fn slot(&self, id: &str) -> Result<Slot> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::types::{Algorithm, MabConfig};

    fn template(id: &str, category: &str) -> PromptTemplate {
        PromptTemplate::new(id, id, "Write a policy for {requirements}", category)
    }

    fn model() -> ConfidenceModel {
        ConfidenceModel::from_config(&MabConfig::with_algorithm(Algorithm::EpsilonGreedy))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = TemplateRegistry::new();
        registry.register(template("a", "constitutional")).unwrap();
        let err = registry.register(template("a", "adaptive")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTemplate(id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_template() {
        let registry = TemplateRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_list_active_filters_and_sorts() {
        let registry = TemplateRegistry::new();
        registry.register(template("c", "fairness_aware")).unwrap();
        registry.register(template("a", "constitutional")).unwrap();
        registry.register(template("b", "constitutional").inactive()).unwrap();

        let ids: Vec<String> = registry.list_active(None).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let constitutional = registry.list_active(Some("constitutional"));
        assert_eq!(constitutional.len(), 1);
        assert_eq!(constitutional[0].id, "a");

        assert_eq!(registry.list_all().len(), 3);
    }

    #[test]
    fn test_deactivate_keeps_template() {
        let registry = TemplateRegistry::new();
        registry.register(template("a", "adaptive")).unwrap();
        registry.deactivate("a").unwrap();

        assert!(registry.list_active(None).is_empty());
        assert!(!registry.get("a").unwrap().is_active);

        registry.activate("a").unwrap();
        assert_eq!(registry.list_active(None).len(), 1);
    }

    #[test]
    fn test_apply_update_changes_only_target() {
        let registry = TemplateRegistry::new();
        registry.register(template("a", "adaptive")).unwrap();
        registry.register(template("b", "adaptive")).unwrap();

        let updated = registry
            .apply_update("a", &StatsDelta::from_reward(0.9, 0.8), &model())
            .unwrap();
        assert_eq!(updated.stats.total_uses, 1);
        assert_eq!(updated.stats.success_count, 1);
        assert_eq!(registry.get("b").unwrap().stats.total_uses, 0);
    }

    #[test]
    fn test_apply_update_reports_current_activation() {
        let registry = TemplateRegistry::new();
        registry.register(template("a", "adaptive")).unwrap();
        let before = registry.get("a").unwrap();
        assert!(before.is_active);

        registry.deactivate("a").unwrap();
        let updated = registry
            .apply_update("a", &StatsDelta::from_reward(0.9, 0.8), &model())
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.stats.total_uses, 1);
    }

    #[test]
    fn test_apply_update_unknown_template() {
        let registry = TemplateRegistry::new();
        let result = registry.apply_update("ghost", &StatsDelta::from_reward(0.5, 0.8), &model());
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = TemplateRegistry::new();
        registry.register(template("a", "adaptive")).unwrap();
        let snapshot = registry.list_active(None);

        registry
            .apply_update("a", &StatsDelta::from_reward(1.0, 0.8), &model())
            .unwrap();

        assert_eq!(snapshot[0].stats.total_uses, 0);
        assert_eq!(registry.get("a").unwrap().stats.total_uses, 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = Arc::new(TemplateRegistry::new());
        registry.register(template("a", "adaptive")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry
                            .apply_update("a", &StatsDelta::from_reward(0.5, 0.8), &model())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = registry.get("a").unwrap().stats;
        assert_eq!(stats.total_uses, 800);
        assert!((stats.average_reward - 0.5).abs() < 1e-9);
    }
}
