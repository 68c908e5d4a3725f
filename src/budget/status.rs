//! Derived budget status.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;

use super::registry::ModelCost;

/// Share of the limit at which the budget alert fires.
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.80;

/// Usage share at which the dashboard reports the budget as critical.
const CRITICAL_PERCENTAGE: f64 = 95.0;

/// Coarse health bucket for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetHealth {
    Healthy,
    Warning,
    Critical,
}

/// Budget snapshot for one billing period.
///
/// Never persisted as the source of truth: rebuilt from the ledger counters
/// on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub credits_used: f64,
    pub credits_limit: f64,
    pub period_start: DateTime<Utc>,
    pub alert_threshold: f64,
    /// True when served from the last-known cache because the store was unreachable.
    pub stale: bool,
}

impl BudgetStatus {
    pub fn new(credits_used: f64, credits_limit: f64, period_start: DateTime<Utc>) -> Self {
        Self {
            credits_used,
            credits_limit,
            period_start,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            stale: false,
        }
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn credits_remaining(&self) -> f64 {
        self.credits_limit - self.credits_used
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.credits_limit <= 0.0 {
            return 100.0;
        }
        100.0 * self.credits_used / self.credits_limit
    }

    pub fn alert_triggered(&self) -> bool {
        self.usage_percentage() >= self.alert_threshold * 100.0
    }

    /// Free models are always affordable; others need the full request cost.
    pub fn can_afford(&self, model: &ModelCost) -> bool {
        model.is_free || self.credits_remaining() >= model.credits_per_request
    }

    /// First instant of the next billing period.
    pub fn period_end(&self) -> DateTime<Utc> {
        next_period_start(self.period_start)
    }

    pub fn health(&self) -> BudgetHealth {
        if self.credits_remaining() <= 0.0 || self.usage_percentage() >= CRITICAL_PERCENTAGE {
            BudgetHealth::Critical
        } else if self.alert_triggered() {
            BudgetHealth::Warning
        } else {
            BudgetHealth::Healthy
        }
    }

    /// Flat record including the computed fields.
    pub fn to_record(&self) -> serde_json::Value {
        serde_json::json!({
            "credits_used": self.credits_used,
            "credits_limit": self.credits_limit,
            "credits_remaining": self.credits_remaining(),
            "usage_percentage": self.usage_percentage(),
            "alert_threshold": self.alert_threshold,
            "alert_triggered": self.alert_triggered(),
            "period_start": self.period_start.to_rfc3339(),
            "period_end": self.period_end().to_rfc3339(),
            "status": self.health(),
            "health": self.health(),
            "stale": self.stale,
        })
    }
}

/// Start of the monthly billing period containing `now`.
pub(crate) fn period_start_of(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Ledger key of the billing period containing `now` (`YYYY-MM`).
pub(crate) fn period_key_of(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

fn next_period_start(start: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ModelRegistry;

    fn status(used: f64, limit: f64) -> BudgetStatus {
        BudgetStatus::new(used, limit, period_start_of(Utc::now()))
    }

    #[test]
    fn computed_fields() {
        let s = status(50.0, 300.0);
        assert_eq!(s.credits_remaining(), 250.0);
        assert!((s.usage_percentage() - 16.666).abs() < 0.01);
        assert!(!s.alert_triggered());
    }

    #[test]
    fn alert_fires_at_threshold() {
        assert!(status(240.0, 300.0).alert_triggered());
        assert!(!status(239.9, 300.0).alert_triggered());
    }

    #[test]
    fn custom_alert_threshold() {
        let s = status(150.0, 300.0).with_alert_threshold(0.50);
        assert_eq!(s.usage_percentage(), 50.0);
        assert!(s.alert_triggered());
    }

    #[test]
    fn affordability_boundary() {
        let registry = ModelRegistry::default();
        let gpt5 = registry.cost_of("gpt-5").unwrap();
        let haiku = registry.cost_of("claude-haiku-4.5").unwrap();
        let gemini = registry.cost_of("gemini-2.5-pro").unwrap();

        let exact = status(299.0, 300.0);
        assert!(exact.can_afford(gpt5));
        assert!(exact.can_afford(haiku));

        let short = status(299.5, 300.0);
        assert!(!short.can_afford(gpt5));
        assert!(short.can_afford(haiku));
        assert!(short.can_afford(gemini));
    }

    #[test]
    fn tracked_zero_cost_model_needs_non_negative_balance() {
        let registry = ModelRegistry::default();
        let deepseek = registry.cost_of("deepseek-v3").unwrap();
        assert!(status(300.0, 300.0).can_afford(deepseek));
        assert!(!status(300.5, 300.0).can_afford(deepseek));
    }

    #[test]
    fn health_buckets() {
        assert_eq!(status(10.0, 300.0).health(), BudgetHealth::Healthy);
        assert_eq!(status(250.0, 300.0).health(), BudgetHealth::Warning);
        assert_eq!(status(290.0, 300.0).health(), BudgetHealth::Critical);
    }

    #[test]
    fn period_boundaries() {
        let now = Utc.with_ymd_and_hms(2026, 12, 17, 8, 30, 0).unwrap();
        let start = period_start_of(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(
            BudgetStatus::new(0.0, 1.0, start).period_end(),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(period_key_of(now), "2026-12");
    }

    #[test]
    fn record_contains_computed_fields() {
        let record = status(100.0, 300.0).to_record();
        assert_eq!(record["credits_used"], 100.0);
        assert_eq!(record["credits_remaining"], 200.0);
        assert_eq!(record["alert_triggered"], false);
        assert!(record.get("period_end").is_some());
        assert_eq!(record["health"], "healthy");
        assert_eq!(record["status"], "healthy");
        assert_eq!(status(290.0, 300.0).to_record()["status"], "critical");
    }
}
