//! Fallback model selection.
//!
//! Prefers the declared fallback chain (usually same provider, cheaper tier)
//! over an arbitrary free model, so output quality only drops as far as the
//! remaining budget forces it to.

use std::collections::HashSet;

use super::ledger::BudgetError;
use super::registry::ModelRegistry;
use super::status::BudgetStatus;

/// Pick an affordable substitute for `requested`.
///
/// Walks `requested`'s fallback chain and returns the first affordable
/// entry; otherwise the first free model in registry order.
pub fn select_fallback(
    requested: &str,
    status: &BudgetStatus,
    registry: &ModelRegistry,
) -> Result<String, BudgetError> {
    let mut visited = HashSet::new();
    visited.insert(requested.to_string());

    let mut next = registry
        .fallback_model_of(requested)
        .map_err(|_| BudgetError::UnknownModel(requested.to_string()))?;

    while let Some(candidate) = next {
        if !visited.insert(candidate.to_string()) {
            break;
        }
        let cost = registry
            .cost_of(candidate)
            .map_err(|_| BudgetError::UnknownModel(candidate.to_string()))?;
        if status.can_afford(cost) {
            return Ok(cost.name.clone());
        }
        next = cost.fallback_model.as_deref();
    }

    registry
        .free_models()
        .next()
        .map(|m| m.name.clone())
        .ok_or_else(|| BudgetError::NoAffordableModel(requested.to_string()))
}
