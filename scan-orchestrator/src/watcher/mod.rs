//! Watchers driving each backend entity kind through its lifecycle.
//!
//! Every watcher implements [`Discover`](crate::common::Discover) and
//! [`Reconcile`](crate::common::Reconcile) and is run by
//! [`spawn_control_loop`](crate::common::spawn_control_loop).

pub mod asset_scan;
pub mod asset_scan_estimation;
pub mod asset_scan_processor;
pub mod scan;
pub mod scan_config;
pub mod scan_estimation;
pub mod schedule;

pub use asset_scan::{AssetScanEvent, AssetScanWatcher};
pub use asset_scan_estimation::{AssetScanEstimationEvent, AssetScanEstimationWatcher};
pub use asset_scan_processor::{AssetScanProcessor, AssetScanResultEvent};
pub use scan::{ScanEvent, ScanWatcher};
pub use scan_config::{ScanConfigEvent, ScanConfigWatcher};
pub use scan_estimation::{ScanEstimationEvent, ScanEstimationWatcher};

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use scan_api::filter::Filter;
use scan_api::{BackendClient, ListParams};
use tracing::debug;

use crate::Result;

/// Ids of the assets that are not terminated and match `scope`.
pub(crate) async fn discover_asset_ids(
    backend: &dyn BackendClient,
    scope: Option<&str>,
) -> Result<Vec<String>> {
    let mut filter = Filter::is_null("terminatedOn");
    if let Some(scope) = scope {
        filter = filter.and(Filter::raw(scope));
    }
    let params = ListParams::new().with_filter(filter).select("id").count();
    let assets = backend.get_assets(params).await?;

    let ids: Vec<String> = assets.items.into_iter().filter_map(|a| a.id).collect();
    debug!(count = ids.len(), scope = scope.unwrap_or(""), "Discovered assets");
    Ok(ids)
}

/// Filter selecting entities that are still running or whose TTL may have expired.
pub(crate) fn active_or_expired_filter(state_field: &str, now: DateTime<Utc>) -> Filter {
    let active = Filter::not_in(state_field, ["Done", "Failed"]);
    let expired = Filter::is_null("deleteAfter").or(Filter::lt("deleteAfter", now));
    active.group().or(expired.group())
}

/// `start + timeout < now`. A missing start time never times out.
pub(crate) fn is_timed_out(
    start: Option<DateTime<Utc>>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(start) = start else {
        return false;
    };
    match TimeDelta::from_std(timeout) {
        Ok(timeout) => start + timeout < now,
        Err(_) => false,
    }
}

/// What to do with a finished entity that carries a time to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    /// Record the deadline and keep the entity for now.
    Stamp {
        end_time: DateTime<Utc>,
        ttl_seconds: u64,
        delete_after: DateTime<Utc>,
    },
    Delete,
    Keep,
}

impl Expiry {
    /// Decides the fate of a finished entity.
    ///
    /// A missing end time defaults to `now` and a missing TTL to `default_ttl`.
    /// The entity is deleted once `now` is strictly past its deadline.
    pub(crate) fn evaluate(
        end_time: Option<DateTime<Utc>>,
        ttl_seconds: Option<u64>,
        delete_after: Option<DateTime<Utc>>,
        default_ttl: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let deadline = match delete_after {
            Some(deadline) => deadline,
            None => {
                let end_time = end_time.unwrap_or(now);
                let ttl_seconds = ttl_seconds.unwrap_or(default_ttl);
                let delete_after = deadline_after(end_time, ttl_seconds);
                if now <= delete_after {
                    return Self::Stamp {
                        end_time,
                        ttl_seconds,
                        delete_after,
                    };
                }
                delete_after
            }
        };

        if now > deadline { Self::Delete } else { Self::Keep }
    }
}

pub(crate) fn deadline_after(end_time: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
    end_time + TimeDelta::try_seconds(ttl).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scan_api::MemoryBackend;
    use scan_api::models::Asset;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 17, h, m, 0).unwrap()
    }

    #[test]
    fn test_timed_out() {
        let timeout = Duration::from_secs(3600);
        assert!(!is_timed_out(None, timeout, at(12, 0)));
        assert!(!is_timed_out(Some(at(11, 0)), timeout, at(12, 0)));
        assert!(is_timed_out(Some(at(10, 59)), timeout, at(12, 0)));
    }

    #[test]
    fn test_expiry_stamps_missing_deadline() {
        let now = at(12, 0);
        assert_eq!(
            Expiry::evaluate(None, None, None, 60, now),
            Expiry::Stamp {
                end_time: now,
                ttl_seconds: 60,
                delete_after: at(12, 1),
            }
        );
        assert_eq!(
            Expiry::evaluate(Some(at(11, 30)), Some(3600), None, 60, now),
            Expiry::Stamp {
                end_time: at(11, 30),
                ttl_seconds: 3600,
                delete_after: at(12, 30),
            }
        );
    }

    #[test]
    fn test_expiry_deletes_past_deadline() {
        let now = at(12, 0);
        assert_eq!(
            Expiry::evaluate(Some(at(10, 0)), Some(60), None, 3600, now),
            Expiry::Delete
        );
        assert_eq!(
            Expiry::evaluate(None, None, Some(at(11, 59)), 3600, now),
            Expiry::Delete
        );
        assert_eq!(
            Expiry::evaluate(None, None, Some(at(12, 0)), 3600, now),
            Expiry::Keep
        );
    }

    #[test]
    fn test_active_or_expired_filter() {
        let f = active_or_expired_filter("status/state", at(11, 0));
        assert_eq!(
            f.as_str(),
            "(status/state ne 'Done' and status/state ne 'Failed') or (deleteAfter eq null or deleteAfter lt 2023-05-17T11:00:00Z)"
        );
    }

    #[tokio::test]
    async fn test_discover_asset_ids_skips_terminated() {
        let backend = MemoryBackend::new();
        for (id, terminated) in [("a-1", None), ("a-2", Some(at(9, 0))), ("a-3", None)] {
            backend
                .post_asset(Asset {
                    id: Some(id.to_string()),
                    terminated_on: terminated,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let mut ids = discover_asset_ids(&backend, None).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a-1", "a-3"]);

        let ids = discover_asset_ids(&backend, Some("id eq 'a-3'")).await.unwrap();
        assert_eq!(ids, vec!["a-3"]);
    }
}
