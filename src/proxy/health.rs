use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::entities::proxy_endpoint;
use crate::proxy::{EndpointKey, ProxyKind};

/// Advisory endpoint health. Never a safety property; it only influences
/// candidate ordering and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub kind: ProxyKind,
    pub id: uuid::Uuid,
    pub name: String,
    pub enabled: bool,
    pub success_count: i64,
    pub fail_count: i64,
    pub consecutive_failures: u32,
    pub avg_response_ms: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub health: Health,
}

/// Tracks reachability and latency of configured proxy endpoints.
///
/// Writers never block each other for long: updates take a short
/// in-memory write lock and the database write-through is best-effort.
pub struct HealthRegistry {
    unreachable_after: u32,
    store: Option<DatabaseConnection>,
    entries: RwLock<HashMap<EndpointKey, EndpointHealth>>,
}

// Smoothing factor for the response-time EWMA.
const RTT_ALPHA: f64 = 0.2;

impl HealthRegistry {
    pub fn new(unreachable_after: u32) -> Self {
        Self {
            unreachable_after,
            store: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a database connection for counter write-through.
    pub fn with_store(mut self, db: DatabaseConnection) -> Self {
        self.store = Some(db);
        self
    }

    /// Merge configured endpoints into the registry: new entries are
    /// seeded from the persisted counters, known entries pick up the
    /// current enabled flag.
    pub async fn sync_endpoints(&self, models: &[proxy_endpoint::Model]) {
        let mut entries = self.entries.write().await;
        for model in models {
            let Some(kind) = ProxyKind::parse(&model.kind) else {
                tracing::warn!(endpoint = %model.id, kind = %model.kind, "skipping endpoint with unknown kind");
                continue;
            };
            entries
                .entry((kind, model.id))
                .and_modify(|entry| {
                    entry.enabled = model.enabled;
                    entry.name = model.name.clone();
                })
                .or_insert_with(|| EndpointHealth {
                    kind,
                    id: model.id,
                    name: model.name.clone(),
                    enabled: model.enabled,
                    success_count: model.success_count,
                    fail_count: model.fail_count,
                    consecutive_failures: 0,
                    avg_response_ms: model.avg_response_ms,
                    last_checked_at: model.last_checked_at,
                    health: Health::Healthy,
                });
        }
    }

    /// Record the outcome of one connection attempt. Fire-and-forget:
    /// persistence failures are logged, never propagated.
    pub async fn record(&self, key: EndpointKey, success: bool, latency: Duration) {
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(key).or_insert_with(|| EndpointHealth {
                kind: key.0,
                id: key.1,
                name: String::new(),
                enabled: true,
                success_count: 0,
                fail_count: 0,
                consecutive_failures: 0,
                avg_response_ms: None,
                last_checked_at: None,
                health: Health::Healthy,
            });

            if success {
                entry.success_count += 1;
                entry.consecutive_failures = 0;
                let sample = latency.as_secs_f64() * 1000.0;
                entry.avg_response_ms = Some(match entry.avg_response_ms {
                    Some(avg) => avg * (1.0 - RTT_ALPHA) + sample * RTT_ALPHA,
                    None => sample,
                });
            } else {
                entry.fail_count += 1;
                entry.consecutive_failures += 1;
            }
            entry.last_checked_at = Some(Utc::now());
            entry.health = self.derive(entry.consecutive_failures);
            entry.clone()
        };

        if let Some(db) = &self.store {
            let result = proxy_endpoint::Entity::update_many()
                .col_expr(
                    proxy_endpoint::Column::SuccessCount,
                    Expr::value(snapshot.success_count),
                )
                .col_expr(
                    proxy_endpoint::Column::FailCount,
                    Expr::value(snapshot.fail_count),
                )
                .col_expr(
                    proxy_endpoint::Column::AvgResponseMs,
                    Expr::value(snapshot.avg_response_ms),
                )
                .col_expr(
                    proxy_endpoint::Column::LastCheckedAt,
                    Expr::value(snapshot.last_checked_at),
                )
                .filter(proxy_endpoint::Column::Id.eq(key.1))
                .exec(db)
                .await;
            if let Err(err) = result {
                tracing::warn!(endpoint = %key.1, "failed to persist proxy health: {err}");
            }
        }
    }

    fn derive(&self, consecutive_failures: u32) -> Health {
        if consecutive_failures == 0 {
            Health::Healthy
        } else if consecutive_failures < self.unreachable_after {
            Health::Degraded
        } else {
            Health::Unreachable
        }
    }

    /// Current health view, for the selector's latency tie-break.
    pub async fn view(&self) -> HashMap<EndpointKey, EndpointHealth> {
        self.entries.read().await.clone()
    }

    /// Endpoints ordered by (enabled, health, id), for reporting.
    pub async fn snapshot(&self) -> Vec<EndpointHealth> {
        let mut all: Vec<EndpointHealth> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then(a.health.cmp(&b.health))
                .then(a.id.cmp(&b.id))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key(n: u128) -> EndpointKey {
        (ProxyKind::Http, Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn unreachable_after_consecutive_failures() {
        let registry = HealthRegistry::new(3);
        let k = key(1);

        registry.record(k, false, Duration::ZERO).await;
        registry.record(k, false, Duration::ZERO).await;
        let view = registry.view().await;
        assert_eq!(view[&k].health, Health::Degraded);

        registry.record(k, false, Duration::ZERO).await;
        let view = registry.view().await;
        assert_eq!(view[&k].health, Health::Unreachable);
        assert_eq!(view[&k].fail_count, 3);
    }

    #[tokio::test]
    async fn success_clears_unreachable() {
        let registry = HealthRegistry::new(3);
        let k = key(2);

        for _ in 0..5 {
            registry.record(k, false, Duration::ZERO).await;
        }
        registry.record(k, true, Duration::from_millis(40)).await;

        let view = registry.view().await;
        assert_eq!(view[&k].health, Health::Healthy);
        assert_eq!(view[&k].consecutive_failures, 0);
        assert_eq!(view[&k].success_count, 1);
        assert_eq!(view[&k].fail_count, 5);
    }

    #[tokio::test]
    async fn latency_is_smoothed() {
        let registry = HealthRegistry::new(3);
        let k = key(3);

        registry.record(k, true, Duration::from_millis(100)).await;
        registry.record(k, true, Duration::from_millis(200)).await;

        let view = registry.view().await;
        let avg = view[&k].avg_response_ms.unwrap();
        // First sample seeds the average, the second nudges it by alpha.
        assert!(avg > 100.0 && avg < 200.0, "avg = {avg}");
    }

    #[tokio::test]
    async fn snapshot_orders_enabled_and_healthy_first() {
        let registry = HealthRegistry::new(3);
        let (a, b) = (key(1), key(2));

        registry.record(a, true, Duration::from_millis(10)).await;
        for _ in 0..3 {
            registry.record(b, false, Duration::ZERO).await;
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].id, a.1);
        assert_eq!(snapshot[1].id, b.1);
    }
}
