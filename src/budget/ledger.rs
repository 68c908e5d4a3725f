//! Budget ledger - shared credit counter for the current billing period.
//!
//! Every pipeline run in every process talks to the same backing store.
//! The only mutation is [`BudgetLedger::record_usage`], which goes through
//! the store's atomic increment; nothing read-modify-writes the counter.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fallback::select_fallback;
use super::registry::ModelRegistry;
use super::status::{period_key_of, period_start_of, BudgetStatus, DEFAULT_ALERT_THRESHOLD};
use super::store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StoreError, UsageRecord};

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No affordable model available to replace {0}")]
    NoAffordableModel(String),

    #[error("Invalid credit amount: {0}")]
    InvalidAmount(f64),

    #[error("Budget store error: {0}")]
    Store(#[from] StoreError),
}

/// Persisted per-period state. The credits counter lives next to it as a
/// separate key so it can be incremented atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeriodState {
    credits_limit: f64,
    period_start: DateTime<Utc>,
}

fn state_key(period: &str) -> String {
    format!("budget:{}", period)
}

fn counter_key(period: &str) -> String {
    format!("budget:{}:credits_used", period)
}

/// Shared, durable credit ledger.
pub struct BudgetLedger {
    store: RwLock<Arc<dyn LedgerStore>>,
    registry: Arc<ModelRegistry>,
    credits_limit: f64,
    alert_threshold: f64,
    last_known: Mutex<Option<BudgetStatus>>,
    last_stamp: Mutex<DateTime<Utc>>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn LedgerStore>, registry: Arc<ModelRegistry>, credits_limit: f64) -> Self {
        Self {
            store: RwLock::new(store),
            registry,
            credits_limit,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            last_known: Mutex::new(None),
            last_stamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Open the SQLite ledger at `path`, degrading to an in-memory ledger
    /// when the file cannot be opened.
    pub fn open(path: &Path, registry: Arc<ModelRegistry>, credits_limit: f64) -> Self {
        let store: Arc<dyn LedgerStore> = match SqliteLedgerStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Budget ledger unavailable, falling back to in-memory ledger"
                );
                Arc::new(MemoryLedgerStore::new())
            }
        };
        Self::new(store, registry, credits_limit)
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn credits_limit(&self) -> f64 {
        self.credits_limit
    }

    fn store(&self) -> Arc<dyn LedgerStore> {
        match self.store.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn degrade(&self) {
        let memory: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        match self.store.write() {
            Ok(mut guard) => *guard = memory,
            Err(poisoned) => *poisoned.into_inner() = memory,
        }
    }

    fn remember(&self, status: &BudgetStatus) {
        if let Ok(mut cache) = self.last_known.lock() {
            *cache = Some(status.clone());
        }
    }

    fn cached(&self) -> Option<BudgetStatus> {
        self.last_known.lock().ok().and_then(|cache| cache.clone())
    }

    /// Monotonic timestamp for the next usage record.
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_stamp.lock() {
            Ok(mut last) => {
                let stamp = now.max(*last);
                *last = stamp;
                stamp
            }
            Err(_) => now,
        }
    }

    /// Load the current period's state, creating it on first use.
    ///
    /// Never fails: an unreachable store is replaced by a fresh in-memory
    /// one so callers can carry on.
    pub async fn initialize(&self) -> BudgetStatus {
        match self.load_or_create().await {
            Ok(status) => {
                tracing::info!(
                    credits_used = status.credits_used,
                    credits_limit = status.credits_limit,
                    period_start = %status.period_start,
                    "Budget ledger initialized"
                );
                status
            }
            Err(e) => {
                tracing::warn!(error = %e, "Budget store unreachable, continuing with in-memory ledger");
                self.degrade();
                match self.load_or_create().await {
                    Ok(status) => status,
                    Err(_) => self.fresh_status(Utc::now()),
                }
            }
        }
    }

    fn fresh_status(&self, now: DateTime<Utc>) -> BudgetStatus {
        BudgetStatus::new(0.0, self.credits_limit, period_start_of(now))
            .with_alert_threshold(self.alert_threshold)
    }

    async fn load_or_create(&self) -> Result<BudgetStatus, StoreError> {
        let store = self.store();
        let now = Utc::now();
        let period = period_key_of(now);
        let key = state_key(&period);

        let state = match store.get(&key).await? {
            Some(raw) => {
                let mut state: PeriodState = serde_json::from_str(&raw)?;
                if state.credits_limit != self.credits_limit {
                    tracing::info!(
                        from = state.credits_limit,
                        to = self.credits_limit,
                        "Budget limit changed for current period"
                    );
                    state.credits_limit = self.credits_limit;
                    store.set(&key, &serde_json::to_string(&state)?).await?;
                }
                state
            }
            None => {
                let state = PeriodState {
                    credits_limit: self.credits_limit,
                    period_start: period_start_of(now),
                };
                store.set(&key, &serde_json::to_string(&state)?).await?;
                state
            }
        };

        let used = store.get_float(&counter_key(&period)).await?.unwrap_or(0.0);
        let status = BudgetStatus::new(used, state.credits_limit, state.period_start)
            .with_alert_threshold(self.alert_threshold);
        self.remember(&status);
        Ok(status)
    }

    async fn read_status(&self) -> Result<BudgetStatus, StoreError> {
        let store = self.store();
        let now = Utc::now();
        let period = period_key_of(now);

        let (limit, period_start) = match store.get(&state_key(&period)).await? {
            Some(raw) => {
                let state: PeriodState = serde_json::from_str(&raw)?;
                (state.credits_limit, state.period_start)
            }
            None => (self.credits_limit, period_start_of(now)),
        };
        let used = store.get_float(&counter_key(&period)).await?.unwrap_or(0.0);

        Ok(BudgetStatus::new(used, limit, period_start).with_alert_threshold(self.alert_threshold))
    }

    /// Current status, read through to the store.
    ///
    /// When the store is unreachable the last known status is returned with
    /// `stale = true`; only a ledger that never read successfully fails.
    pub async fn get_status(&self) -> Result<BudgetStatus, BudgetError> {
        match self.read_status().await {
            Ok(status) => {
                self.remember(&status);
                Ok(status)
            }
            Err(e) => match self.cached() {
                Some(mut status) => {
                    tracing::warn!(error = %e, "Budget store unreachable, serving stale status");
                    status.stale = true;
                    Ok(status)
                }
                None => Err(BudgetError::Store(e)),
            },
        }
    }

    pub async fn can_use_model(&self, model: &str) -> Result<bool, BudgetError> {
        let cost = self
            .registry
            .cost_of(model)
            .map_err(|_| BudgetError::UnknownModel(model.to_string()))?;
        if cost.is_free {
            return Ok(true);
        }
        Ok(self.get_status().await?.can_afford(cost))
    }

    /// Record credits spent on `model` and return the post-update status.
    ///
    /// Store failures are returned, never dropped.
    pub async fn record_usage(
        &self,
        model: &str,
        credits_used: f64,
        metadata: serde_json::Value,
    ) -> Result<BudgetStatus, BudgetError> {
        if !self.registry.contains(model) {
            return Err(BudgetError::UnknownModel(model.to_string()));
        }
        if !credits_used.is_finite() || credits_used < 0.0 {
            return Err(BudgetError::InvalidAmount(credits_used));
        }

        let store = self.store();
        let period = period_key_of(Utc::now());
        let record = UsageRecord {
            model: model.to_string(),
            credits: credits_used,
            recorded_at: self.next_stamp(),
            metadata,
        };
        let used = store
            .record(&counter_key(&period), &record)
            .await
            .map_err(|e| {
                tracing::error!(model = %model, credits = credits_used, error = %e, "Failed to record usage");
                BudgetError::Store(e)
            })?;

        let status = match self.read_status().await {
            Ok(status) => status,
            Err(_) => BudgetStatus::new(used, self.credits_limit, period_start_of(Utc::now()))
                .with_alert_threshold(self.alert_threshold),
        };
        self.remember(&status);

        tracing::debug!(
            model = %model,
            credits = credits_used,
            credits_used_total = status.credits_used,
            "Recorded model usage"
        );
        if status.alert_triggered() {
            tracing::warn!(
                usage_percentage = status.usage_percentage(),
                credits_remaining = status.credits_remaining(),
                "Budget alert threshold reached"
            );
        }
        Ok(status)
    }

    pub async fn get_remaining_credits(&self) -> Result<f64, BudgetError> {
        Ok(self.get_status().await?.credits_remaining())
    }

    /// Credits recorded at or after `since`, across every caller of the ledger.
    pub async fn get_usage_since(&self, since: DateTime<Utc>) -> Result<f64, BudgetError> {
        Ok(self.store().usage_since(since).await?)
    }

    /// Affordable substitute for `model`.
    pub async fn get_fallback_model(&self, model: &str) -> Result<String, BudgetError> {
        let status = self.get_status().await?;
        let fallback = select_fallback(model, &status, &self.registry)?;
        tracing::info!(
            requested = %model,
            fallback = %fallback,
            credits_remaining = status.credits_remaining(),
            "Selected fallback model"
        );
        Ok(fallback)
    }

    pub async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, BudgetError> {
        Ok(self.store().recent_usage(limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    /// Memory store that can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryLedgerStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set(key, value).await
        }
        async fn get_float(&self, key: &str) -> Result<Option<f64>, StoreError> {
            self.check()?;
            self.inner.get_float(key).await
        }
        async fn increment_float(&self, key: &str, amount: f64) -> Result<f64, StoreError> {
            self.check()?;
            self.inner.increment_float(key, amount).await
        }
        async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.append_usage(record).await
        }
        async fn record(&self, key: &str, record: &UsageRecord) -> Result<f64, StoreError> {
            self.check()?;
            self.inner.record(key, record).await
        }
        async fn usage_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
            self.check()?;
            self.inner.usage_since(since).await
        }
        async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
            self.check()?;
            self.inner.recent_usage(limit).await
        }
    }

    fn ledger_with(store: Arc<dyn LedgerStore>) -> BudgetLedger {
        BudgetLedger::new(store, Arc::new(ModelRegistry::default()), 300.0)
    }

    async fn ledger_at(used: f64) -> BudgetLedger {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        ledger.initialize().await;
        if used > 0.0 {
            ledger.record_usage("gpt-5", used, json!({})).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn initialize_creates_period_state() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ledger_with(store.clone());
        let status = ledger.initialize().await;
        assert_eq!(status.credits_used, 0.0);
        assert_eq!(status.credits_limit, 300.0);
        assert!(!status.stale);

        let key = state_key(&period_key_of(Utc::now()));
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn initialize_degrades_when_store_is_down() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let ledger = ledger_with(store);

        let status = ledger.initialize().await;
        assert_eq!(status.credits_used, 0.0);
        // Now backed by memory: writes succeed.
        assert_ok!(ledger.record_usage("gpt-5", 1.0, json!({})).await);
        assert_eq!(ledger.get_remaining_credits().await.unwrap(), 299.0);
    }

    #[tokio::test]
    async fn status_reflects_latest_usage() {
        let ledger = ledger_at(100.0).await;
        let status = ledger.get_status().await.unwrap();
        assert_eq!(status.credits_used, 100.0);
        assert_eq!(status.credits_remaining(), 200.0);
        assert!((status.usage_percentage() - 33.33).abs() < 0.01);
    }

    #[tokio::test]
    async fn can_use_model_respects_balance() {
        let ledger = ledger_at(10.0).await;
        assert!(ledger.can_use_model("gpt-5").await.unwrap());

        let ledger = ledger_at(299.5).await;
        assert!(!ledger.can_use_model("gpt-5").await.unwrap());
        assert!(ledger.can_use_model("gemini-2.5-pro").await.unwrap());
        assert!(matches!(
            ledger.can_use_model("gpt-17").await,
            Err(BudgetError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn record_usage_sums_concurrent_writes() {
        let ledger = Arc::new(ledger_at(0.0).await);
        let amounts = [1.0, 0.33, 0.5, 2.0, 0.25, 1.0, 0.33, 0.75];
        let mut handles = Vec::new();
        for amount in amounts {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .record_usage("claude-haiku-4.5", amount, json!({ "stage": "x" }))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let expected: f64 = amounts.iter().sum();
        let used = ledger.get_status().await.unwrap().credits_used;
        assert!((used - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sqlite_ledgers_share_one_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        let registry = Arc::new(ModelRegistry::default());
        let a = BudgetLedger::open(&path, Arc::clone(&registry), 300.0);
        let b = BudgetLedger::open(&path, registry, 300.0);
        a.initialize().await;
        b.initialize().await;

        a.record_usage("gpt-5", 1.0, json!({})).await.unwrap();
        b.record_usage("claude-haiku-4.5", 0.33, json!({})).await.unwrap();

        let seen_by_a = a.get_status().await.unwrap().credits_used;
        assert!((seen_by_a - 1.33).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_log_write_leaves_counter_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        let ledger = BudgetLedger::open(&path, Arc::new(ModelRegistry::default()), 300.0);
        ledger.initialize().await;
        ledger.record_usage("gpt-5", 1.0, json!({})).await.unwrap();

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE usage_log;")
            .unwrap();

        assert!(matches!(
            ledger.record_usage("gpt-5", 1.0, json!({})).await,
            Err(BudgetError::Store(_))
        ));
        assert_eq!(ledger.get_status().await.unwrap().credits_used, 1.0);
    }

    #[tokio::test]
    async fn usage_since_attributes_a_run() {
        let ledger = ledger_at(5.0).await;
        let run_start = Utc::now();
        ledger.record_usage("gpt-5", 1.0, json!({ "run": "b" })).await.unwrap();
        ledger.record_usage("claude-haiku-4.5", 0.33, json!({ "run": "b" })).await.unwrap();
        let spent = ledger.get_usage_since(run_start).await.unwrap();
        assert!((spent - 1.33).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_usage_rejects_bad_input() {
        let ledger = ledger_at(0.0).await;
        assert_err!(ledger.record_usage("gpt-17", 1.0, json!({})).await);
        assert!(matches!(
            ledger.record_usage("gpt-5", -1.0, json!({})).await,
            Err(BudgetError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn outage_serves_stale_reads_and_fails_writes() {
        let store = Arc::new(FlakyStore::default());
        let ledger = ledger_with(store.clone());
        ledger.initialize().await;
        ledger.record_usage("gpt-5", 1.0, json!({})).await.unwrap();

        store.down.store(true, Ordering::SeqCst);

        let status = ledger.get_status().await.unwrap();
        assert!(status.stale);
        assert_eq!(status.credits_used, 1.0);

        assert!(matches!(
            ledger.record_usage("gpt-5", 1.0, json!({})).await,
            Err(BudgetError::Store(_))
        ));
    }

    #[tokio::test]
    async fn read_without_any_cache_fails() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let ledger = ledger_with(store);
        assert!(ledger.get_status().await.is_err());
    }

    #[tokio::test]
    async fn fallback_model_follows_declared_chain() {
        let ledger = ledger_at(10.0).await;
        assert_eq!(ledger.get_fallback_model("gpt-5").await.unwrap(), "gpt-4o");

        let ledger = ledger_at(299.5).await;
        let fallback = ledger.get_fallback_model("claude-sonnet-4.5").await.unwrap();
        assert_eq!(fallback, "claude-haiku-4.5");
    }

    #[tokio::test]
    async fn recent_usage_lists_newest_first() {
        let ledger = ledger_at(0.0).await;
        ledger.record_usage("gpt-5", 1.0, json!({ "n": 1 })).await.unwrap();
        ledger.record_usage("gpt-4o", 0.0, json!({ "n": 2 })).await.unwrap();
        let recent = ledger.recent_usage(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].model, "gpt-4o");
    }
}
