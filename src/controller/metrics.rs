//! Prometheus metrics for the Linode cloud controller manager
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `linode_ccm_reconcile_total` (counter): reconciles labeled by controller and result.
//! - `linode_ccm_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `linode_ccm_cloud_api_errors_total` (counter): failed Linode API calls labeled by error kind.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::Error;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
    /// "success" or the error's metric label
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApiErrorLabels {
    /// Classified kind, e.g. "not_found", "rate_limited"
    pub kind: String,
}

pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<DurationLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5min across 16 buckets; NodeBalancer creation is slow.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }
    Family::new_with_constructor(reconcile_histogram)
});

pub static CLOUD_API_ERRORS_TOTAL: Lazy<Family<ApiErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "linode_ccm_reconcile",
        "Total number of reconciles by controller and result",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "linode_ccm_reconcile_duration_seconds",
        "Duration of reconciles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "linode_ccm_cloud_api_errors",
        "Total number of failed Linode API calls by error kind",
        CLOUD_API_ERRORS_TOTAL.clone(),
    );
    registry
});

/// Record the outcome and duration of one reconcile
pub fn observe_reconcile<T>(controller: &str, seconds: f64, result: &Result<T, Error>) {
    let outcome = match result {
        Ok(_) => "success".to_string(),
        Err(e) => {
            if let Error::LinodeError(api) = e {
                inc_cloud_api_error(api.kind().as_str());
            }
            e.metric_label().to_string()
        }
    };
    RECONCILE_TOTAL
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
            result: outcome,
        })
        .inc();
    RECONCILE_DURATION_SECONDS
        .get_or_create(&DurationLabels {
            controller: controller.to_string(),
        })
        .observe(seconds);
}

pub fn inc_cloud_api_error(kind: &str) {
    CLOUD_API_ERRORS_TOTAL
        .get_or_create(&ApiErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}
