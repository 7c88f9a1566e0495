// Model catalog - caches the vendor's model list and resolves requested names

use parking_lot::RwLock;
use std::time::{Duration, Instant};

use super::{default_models, ModelDescriptor};

#[derive(Debug)]
struct CachedCatalog {
    models: Vec<ModelDescriptor>,
    fetched_at: Instant,
}

/// Static model table plus the most recently fetched vendor catalog
#[derive(Debug)]
pub struct ModelCatalog {
    static_models: Vec<ModelDescriptor>,
    cached: RwLock<Option<CachedCatalog>>,
    ttl: Duration,
}

impl ModelCatalog {
    pub fn new(ttl: Duration) -> Self {
        Self::with_static_models(default_models(), ttl)
    }

    pub fn with_static_models(static_models: Vec<ModelDescriptor>, ttl: Duration) -> Self {
        Self {
            static_models,
            cached: RwLock::new(None),
            ttl,
        }
    }

    /// Fetched entries if they are still fresh
    pub fn fresh(&self) -> Option<Vec<ModelDescriptor>> {
        let cached = self.cached.read();
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.models.clone())
    }

    pub fn store(&self, models: Vec<ModelDescriptor>) {
        tracing::debug!("Caching {} catalog models", models.len());
        *self.cached.write() = Some(CachedCatalog {
            models,
            fetched_at: Instant::now(),
        });
    }

    /// Every known model: fetched entries first, then static ones not shadowed by them.
    pub fn all(&self) -> Vec<ModelDescriptor> {
        let mut models = self
            .cached
            .read()
            .as_ref()
            .map(|c| c.models.clone())
            .unwrap_or_default();

        for model in &self.static_models {
            if !models.iter().any(|m| m.id == model.id) {
                models.push(model.clone());
            }
        }
        models
    }

    /// Look up a descriptor by exact id or name, including stale fetched entries.
    pub fn lookup(&self, model: &str) -> Option<ModelDescriptor> {
        self.all().into_iter().find(|m| m.matches_name(model))
    }
}

/// Match a caller-supplied model name against a catalog.
///
/// Exact id or name wins. Otherwise the longest id that starts with the
/// requested name is chosen, then the first id containing it.
pub fn resolve_model<'a>(catalog: &'a [ModelDescriptor], requested: &str) -> Option<&'a ModelDescriptor> {
    if requested.is_empty() {
        return None;
    }

    if let Some(exact) = catalog.iter().find(|m| m.matches_name(requested)) {
        return Some(exact);
    }

    let prefixed = catalog
        .iter()
        .filter(|m| m.id.starts_with(requested))
        .fold(None::<&ModelDescriptor>, |best, m| match best {
            Some(b) if b.id.len() >= m.id.len() => Some(b),
            _ => Some(m),
        });
    if prefixed.is_some() {
        return prefixed;
    }

    catalog.iter().find(|m| m.id.contains(requested))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ModelLimits;

    fn catalog(ids: &[&str]) -> Vec<ModelDescriptor> {
        ids.iter()
            .map(|id| ModelDescriptor::from_catalog(id, "", ModelLimits::default()))
            .collect()
    }

    #[test]
    fn test_exact_match_wins_over_prefix() {
        let models = catalog(&["gpt-4o-mini", "gpt-4o"]);
        assert_eq!(resolve_model(&models, "gpt-4o").unwrap().id, "gpt-4o");
    }

    #[test]
    fn test_prefix_match() {
        let models = catalog(&["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(resolve_model(&models, "gpt-4o-m").unwrap().id, "gpt-4o-mini");
    }

    #[test]
    fn test_longest_prefix_candidate_wins() {
        let models = catalog(&["claude-3.5-sonnet", "claude-3.7-sonnet-thought", "gpt-4o"]);
        assert_eq!(
            resolve_model(&models, "claude-3").unwrap().id,
            "claude-3.7-sonnet-thought"
        );
    }

    #[test]
    fn test_matches_display_name() {
        let models = vec![ModelDescriptor::from_catalog(
            "gpt-4o-2024-11-20",
            "GPT 4o",
            ModelLimits::default(),
        )];
        assert_eq!(resolve_model(&models, "GPT 4o").unwrap().id, "gpt-4o-2024-11-20");
    }

    #[test]
    fn test_substring_fallback() {
        let models = catalog(&["o3-mini", "gpt-4o-mini"]);
        assert_eq!(resolve_model(&models, "4o-mini").unwrap().id, "gpt-4o-mini");
    }

    #[test]
    fn test_unknown_model() {
        let models = catalog(&["gpt-4o"]);
        assert!(resolve_model(&models, "llama").is_none());
        assert!(resolve_model(&models, "").is_none());
    }

    #[test]
    fn test_catalog_cache_freshness() {
        let catalog_cache = ModelCatalog::new(Duration::from_secs(60));
        assert!(catalog_cache.fresh().is_none());

        catalog_cache.store(catalog(&["gpt-4o"]));
        assert_eq!(catalog_cache.fresh().unwrap().len(), 1);

        let expired = ModelCatalog::new(Duration::ZERO);
        expired.store(catalog(&["gpt-4o"]));
        assert!(expired.fresh().is_none());
        assert!(expired.lookup("gpt-4o").is_some());
    }

    #[test]
    fn test_all_merges_static_models() {
        let catalog_cache = ModelCatalog::new(Duration::from_secs(60));
        catalog_cache.store(catalog(&["gpt-4o"]));
        let ids: Vec<String> = catalog_cache.all().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["gpt-4o".to_string(), "copilot-chat".to_string()]);
    }
}
