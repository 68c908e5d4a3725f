//! Model cost registry.
//!
//! Pure data: one entry per model, fixed at process start.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use thiserror::Error;

/// Credit cost and limits of a single model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCost {
    pub name: String,
    /// OpenRouter model id used when calling the provider.
    pub route: String,
    pub credits_per_request: f64,
    /// Free models are always affordable. A zero-cost model can still be
    /// tracked (not free), and then needs a non-negative balance.
    pub is_free: bool,
    pub fallback_model: Option<String>,
    pub rpm_limit: u32,
    pub context_window: u32,
}

impl ModelCost {
    fn new(
        name: &str,
        route: &str,
        credits_per_request: f64,
        is_free: bool,
        fallback_model: Option<&str>,
        rpm_limit: u32,
        context_window: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            route: route.to_string(),
            credits_per_request,
            is_free,
            fallback_model: fallback_model.map(str::to_string),
            rpm_limit,
            context_window,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model {model} costs {cost} credits but declares no fallback")]
    MissingFallback { model: String, cost: f64 },

    #[error("Model {model} falls back to unknown model {fallback}")]
    DanglingFallback { model: String, fallback: String },

    #[error("Fallback chain from {0} never reaches a free model")]
    UnterminatedChain(String),

    #[error("Model {model} has invalid limits: {reason}")]
    InvalidEntry { model: String, reason: String },
}

/// Immutable mapping from model id to [`ModelCost`].
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelCost>,
}

impl ModelRegistry {
    /// Build a registry and check its invariants.
    pub fn new(entries: Vec<ModelCost>) -> Result<Self, RegistryError> {
        let models = entries
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect::<BTreeMap<_, _>>();
        let registry = Self { models };
        registry.validate()?;
        Ok(registry)
    }

    /// Look up a model's cost entry.
    pub fn cost_of(&self, model: &str) -> Result<&ModelCost, RegistryError> {
        self.models
            .get(model)
            .ok_or_else(|| RegistryError::UnknownModel(model.to_string()))
    }

    /// Declared fallback of a model, if any.
    pub fn fallback_model_of(&self, model: &str) -> Result<Option<&str>, RegistryError> {
        Ok(self.cost_of(model)?.fallback_model.as_deref())
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Entries in stable (name) order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelCost> {
        self.models.values()
    }

    /// Free models in stable (name) order.
    pub fn free_models(&self) -> impl Iterator<Item = &ModelCost> {
        self.models.values().filter(|m| m.is_free)
    }

    /// Check every entry's limits and fallback chain.
    ///
    /// # Postcondition
    /// From every paid model, following `fallback_model` reaches a free
    /// model in at most `len()` hops.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for model in self.models.values() {
            if model.credits_per_request < 0.0 || !model.credits_per_request.is_finite() {
                return Err(RegistryError::InvalidEntry {
                    model: model.name.clone(),
                    reason: "credits_per_request must be a non-negative number".to_string(),
                });
            }
            if model.rpm_limit == 0 || model.context_window == 0 {
                return Err(RegistryError::InvalidEntry {
                    model: model.name.clone(),
                    reason: "rpm_limit and context_window must be positive".to_string(),
                });
            }
            match &model.fallback_model {
                Some(fallback) if !self.models.contains_key(fallback) => {
                    return Err(RegistryError::DanglingFallback {
                        model: model.name.clone(),
                        fallback: fallback.clone(),
                    });
                }
                None if model.credits_per_request > 0.0 => {
                    return Err(RegistryError::MissingFallback {
                        model: model.name.clone(),
                        cost: model.credits_per_request,
                    });
                }
                _ => {}
            }
        }

        for model in self.models.values().filter(|m| m.credits_per_request > 0.0) {
            self.chain_to_free(&model.name)?;
        }
        Ok(())
    }

    /// Number of hops from `model` to the first free model on its chain.
    pub fn chain_to_free(&self, model: &str) -> Result<usize, RegistryError> {
        let mut seen = HashSet::new();
        let mut current = self.cost_of(model)?;
        let mut hops = 0;
        while !current.is_free {
            if !seen.insert(current.name.as_str()) || hops > self.models.len() {
                return Err(RegistryError::UnterminatedChain(model.to_string()));
            }
            let next = current
                .fallback_model
                .as_deref()
                .ok_or_else(|| RegistryError::UnterminatedChain(model.to_string()))?;
            current = self.cost_of(next)?;
            hops += 1;
        }
        Ok(hops)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let registry = Self {
            models: default_models()
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
        };
        debug_assert!(
            registry.validate().is_ok(),
            "built-in model table is invalid: {:?}",
            registry.validate()
        );
        registry
    }
}

fn default_models() -> Vec<ModelCost> {
    vec![
        ModelCost::new("gpt-5", "openai/gpt-5", 1.0, false, Some("gpt-4o"), 10, 400_000),
        ModelCost::new(
            "claude-sonnet-4.5",
            "anthropic/claude-sonnet-4.5",
            1.0,
            false,
            Some("claude-haiku-4.5"),
            50,
            200_000,
        ),
        ModelCost::new(
            "claude-haiku-4.5",
            "anthropic/claude-haiku-4.5",
            0.33,
            false,
            Some("gemini-2.5-pro"),
            50,
            200_000,
        ),
        ModelCost::new("gemini-2.5-pro", "google/gemini-2.5-pro", 0.0, true, None, 5, 1_000_000),
        ModelCost::new("gpt-4o", "openai/gpt-4o", 0.0, true, None, 15, 128_000),
        ModelCost::new(
            "deepseek-v3",
            "deepseek/deepseek-chat",
            0.0,
            false,
            Some("llama-3.3-70b"),
            30,
            128_000,
        ),
        ModelCost::new(
            "llama-3.3-70b",
            "meta-llama/llama-3.3-70b-instruct",
            0.0,
            true,
            None,
            30,
            128_000,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_is_valid() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.len(), 7);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn built_in_table_passes_constructor_checks() {
        let checked = ModelRegistry::new(default_models()).unwrap();
        let default = ModelRegistry::default();
        assert!(checked.iter().eq(default.iter()));
    }

    #[test]
    fn paid_model_costs() {
        let registry = ModelRegistry::default();
        let gpt5 = registry.cost_of("gpt-5").unwrap();
        assert_eq!(gpt5.credits_per_request, 1.0);
        assert!(!gpt5.is_free);
        assert_eq!(gpt5.fallback_model.as_deref(), Some("gpt-4o"));
        assert_eq!(registry.cost_of("claude-haiku-4.5").unwrap().credits_per_request, 0.33);
    }

    #[test]
    fn tracked_zero_cost_model_is_not_free() {
        let registry = ModelRegistry::default();
        let deepseek = registry.cost_of("deepseek-v3").unwrap();
        assert_eq!(deepseek.credits_per_request, 0.0);
        assert!(!deepseek.is_free);
    }

    #[test]
    fn unknown_model_is_an_error() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.cost_of("gpt-17").unwrap_err(),
            RegistryError::UnknownModel("gpt-17".to_string())
        );
    }

    #[test]
    fn every_paid_chain_reaches_a_free_model() {
        let registry = ModelRegistry::default();
        for model in registry.iter().filter(|m| m.credits_per_request > 0.0) {
            let hops = registry.chain_to_free(&model.name).unwrap();
            assert!(hops >= 1 && hops <= registry.len(), "{}: {}", model.name, hops);
        }
        assert_eq!(registry.chain_to_free("claude-sonnet-4.5").unwrap(), 2);
    }

    #[test]
    fn rejects_paid_model_without_fallback() {
        let err = ModelRegistry::new(vec![ModelCost::new("paid", "x/paid", 2.0, false, None, 1, 1)])
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingFallback { .. }));
    }

    #[test]
    fn rejects_dangling_fallback() {
        let err = ModelRegistry::new(vec![ModelCost::new(
            "paid",
            "x/paid",
            2.0,
            false,
            Some("ghost"),
            1,
            1,
        )])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DanglingFallback { .. }));
    }

    #[test]
    fn rejects_fallback_cycle() {
        let err = ModelRegistry::new(vec![
            ModelCost::new("a", "x/a", 1.0, false, Some("b"), 1, 1),
            ModelCost::new("b", "x/b", 1.0, false, Some("a"), 1, 1),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::UnterminatedChain("a".to_string()));
    }
}
