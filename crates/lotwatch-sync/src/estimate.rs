use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use lotwatch_core::{AuctionItem, CachedEstimate, ItemKey, ValueEstimate};
use lotwatch_storage::ItemStore;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EstimationError {
    #[error("estimator failed: {0}")]
    Failed(String),
    #[error("estimator returned an inconsistent range (low {low}, average {average}, high {high})")]
    InvalidRange { low: f64, average: f64, high: f64 },
}

/// External value estimator. Slow and possibly costly, so callers go
/// through [`EstimateCache`].
#[async_trait]
pub trait Estimator: Send + Sync {
    async fn estimate(&self, item: &AuctionItem) -> Result<ValueEstimate, EstimationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EstimateOutcome {
    /// Served from the stored estimate without calling the estimator.
    Cached(CachedEstimate),
    /// Computed now and persisted.
    Fresh(CachedEstimate),
    Unavailable { reason: String },
}

impl EstimateOutcome {
    pub fn estimate(&self) -> Option<&CachedEstimate> {
        match self {
            Self::Cached(e) | Self::Fresh(e) => Some(e),
            Self::Unavailable { .. } => None,
        }
    }

    fn unavailable(reason: impl ToString) -> Self {
        Self::Unavailable {
            reason: reason.to_string(),
        }
    }
}

type Flight = Shared<BoxFuture<'static, EstimateOutcome>>;

/// Read-through estimate cache with at most one computation in flight per item.
#[derive(Clone)]
pub struct EstimateCache {
    store: Arc<dyn ItemStore>,
    estimator: Arc<dyn Estimator>,
    max_age: Option<Duration>,
    in_flight: Arc<Mutex<HashMap<ItemKey, Flight>>>,
}

impl EstimateCache {
    pub fn new(store: Arc<dyn ItemStore>, estimator: Arc<dyn Estimator>) -> Self {
        Self {
            store,
            estimator,
            max_age: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stored estimates older than `max_age` are recomputed on read.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub async fn get_estimate(&self, key: &ItemKey) -> EstimateOutcome {
        let item = match self.load(key).await {
            Ok(item) => item,
            Err(outcome) => return outcome,
        };
        if let Some(cached) = item.estimate.clone().filter(|c| self.is_fresh(c, Utc::now())) {
            debug!(%key, "estimate cache hit");
            return EstimateOutcome::Cached(cached);
        }
        self.join_flight(item, false).await
    }

    /// Recomputes even when a stored estimate exists. Still single-flight.
    pub async fn refresh_estimate(&self, key: &ItemKey) -> EstimateOutcome {
        match self.load(key).await {
            Ok(item) => self.join_flight(item, true).await,
            Err(outcome) => outcome,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn load(&self, key: &ItemKey) -> Result<AuctionItem, EstimateOutcome> {
        match self.store.get_item(key).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(EstimateOutcome::unavailable(format!("no item {key}"))),
            Err(err) => Err(EstimateOutcome::unavailable(err)),
        }
    }

    fn is_fresh(&self, cached: &CachedEstimate, now: DateTime<Utc>) -> bool {
        self.max_age.is_none_or(|age| now - cached.computed_at <= age)
    }

    async fn join_flight(&self, item: AuctionItem, force: bool) -> EstimateOutcome {
        let key = item.key.clone();
        let flight = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(flight) => {
                    debug!(%key, "joining in-flight estimate");
                    flight.clone()
                }
                None => {
                    let flight = self.compute(item, force).boxed().shared();
                    in_flight.insert(key, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    fn compute(
        &self,
        item: AuctionItem,
        force: bool,
    ) -> impl std::future::Future<Output = EstimateOutcome> + Send + 'static {
        let store = self.store.clone();
        let estimator = self.estimator.clone();
        let in_flight = self.in_flight.clone();
        let max_age = self.max_age;
        async move {
            let key = item.key.clone();
            let outcome = compute_estimate(store, estimator, item, force, max_age).await;
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            outcome
        }
    }
}

async fn compute_estimate(
    store: Arc<dyn ItemStore>,
    estimator: Arc<dyn Estimator>,
    item: AuctionItem,
    force: bool,
    max_age: Option<Duration>,
) -> EstimateOutcome {
    let key = item.key.clone();

    // A flight that finished between our read and our insert already stored a result.
    if !force {
        if let Ok(Some(current)) = store.get_item(&key).await {
            let now = Utc::now();
            if let Some(cached) = current
                .estimate
                .filter(|c| max_age.is_none_or(|age| now - c.computed_at <= age))
            {
                return EstimateOutcome::Cached(cached);
            }
        }
    }

    let estimate = match estimator.estimate(&item).await.and_then(check_range) {
        Ok(estimate) => estimate,
        Err(err) => {
            warn!(%key, error = %err, "estimate unavailable");
            return EstimateOutcome::unavailable(err);
        }
    };

    let cached = CachedEstimate {
        estimate,
        computed_at: Utc::now(),
    };
    if let Err(err) = store.set_estimate(&key, &cached).await {
        warn!(%key, error = %err, "failed to persist estimate");
        return EstimateOutcome::unavailable(err);
    }
    info!(%key, average = cached.estimate.average, "estimate computed");
    EstimateOutcome::Fresh(cached)
}

fn check_range(estimate: ValueEstimate) -> Result<ValueEstimate, EstimationError> {
    let ValueEstimate { low, average, high, .. } = estimate;
    let finite = low.is_finite() && average.is_finite() && high.is_finite();
    if !finite || low < 0.0 || low > average || average > high {
        return Err(EstimationError::InvalidRange { low, average, high });
    }
    Ok(estimate)
}
