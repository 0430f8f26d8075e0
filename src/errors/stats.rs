//! In-process accumulation of classified errors, exposed through Health &
//! Metrics per SPEC_FULL §4.11: total by category, total by severity, and
//! the top fingerprints by occurrence count.

use std::collections::HashMap;
use std::sync::Arc;

use salvo::oapi::ToSchema;
use serde::Serialize;
use tokio::sync::Mutex;

use super::classifier::{ClassifiedError, ErrorCategory, ErrorSeverity};

const TOP_FINGERPRINTS: usize = 5;

struct Inner {
    total: u64,
    by_category: HashMap<ErrorCategory, u64>,
    by_severity: HashMap<ErrorSeverity, u64>,
    fingerprints: HashMap<String, FingerprintCount>,
}

#[derive(Clone)]
struct FingerprintCount {
    message: String,
    count: u64,
}

/// Shared across the Turn Pipeline and the Connection Pool's maintenance
/// loop; one instance lives in `AppState` for the life of the process.
pub struct ClassifierStats {
    inner: Mutex<Inner>,
}

impl ClassifierStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                total: 0,
                by_category: HashMap::new(),
                by_severity: HashMap::new(),
                fingerprints: HashMap::new(),
            }),
        })
    }

    pub async fn record(&self, classified: &ClassifiedError) {
        let mut inner = self.inner.lock().await;
        inner.total += 1;
        *inner.by_category.entry(classified.category).or_insert(0) += 1;
        *inner.by_severity.entry(classified.severity).or_insert(0) += 1;
        let entry = inner
            .fingerprints
            .entry(classified.fingerprint.clone())
            .or_insert_with(|| FingerprintCount {
                message: classified.message.clone(),
                count: 0,
            });
        entry.count += 1;
    }

    pub async fn snapshot(&self) -> ClassifierSnapshot {
        let inner = self.inner.lock().await;
        let mut top_fingerprints: Vec<FingerprintSnapshot> = inner
            .fingerprints
            .iter()
            .map(|(fingerprint, fc)| FingerprintSnapshot {
                fingerprint: fingerprint.clone(),
                message: fc.message.clone(),
                count: fc.count,
            })
            .collect();
        top_fingerprints.sort_by(|a, b| b.count.cmp(&a.count));
        top_fingerprints.truncate(TOP_FINGERPRINTS);

        ClassifierSnapshot {
            total_classified: inner.total,
            by_category: ErrorCategory::ALL
                .iter()
                .map(|c| (format!("{c:?}").to_lowercase(), *inner.by_category.get(c).unwrap_or(&0)))
                .collect(),
            by_severity: ErrorSeverity::ALL
                .iter()
                .map(|s| (format!("{s:?}").to_lowercase(), *inner.by_severity.get(s).unwrap_or(&0)))
                .collect(),
            top_fingerprints,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FingerprintSnapshot {
    pub fingerprint: String,
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ClassifierSnapshot {
    pub total_classified: u64,
    pub by_category: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub top_fingerprints: Vec<FingerprintSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::super::classifier::classify;
    use super::*;

    #[tokio::test]
    async fn records_accumulate_by_category_and_severity() {
        let stats = ClassifierStats::new();
        stats.record(&classify("request timed out")).await;
        stats.record(&classify("request timed out")).await;
        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.total_classified, 2);
        assert_eq!(snapshot.by_category.get("timeout"), Some(&2));
    }

    #[tokio::test]
    async fn top_fingerprints_sorted_descending_by_count() {
        let stats = ClassifierStats::new();
        stats.record(&classify("request timed out")).await;
        stats.record(&classify("request timed out")).await;
        stats.record(&classify("connection refused")).await;
        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.top_fingerprints[0].count, 2);
    }
}
