use std::cmp::Ordering;
use std::collections::HashMap;

use crate::db::entities::{proxy_endpoint, proxy_policy};
use crate::proxy::health::EndpointHealth;
use crate::proxy::{Candidate, EndpointKey, ProxyKind, ProxySpec};

/// Selection policy, loaded from the store once per request.
#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
    pub proxy_enabled: bool,
    pub pinned: Option<EndpointKey>,
}

impl SelectionPolicy {
    /// A missing policy row means proxying is off.
    pub fn from_model(model: Option<proxy_policy::Model>) -> Self {
        match model {
            None => Self::default(),
            Some(row) => {
                let pinned = match (row.pinned_kind.as_deref(), row.pinned_id) {
                    (Some(kind), Some(id)) => ProxyKind::parse(kind).map(|k| (k, id)),
                    _ => None,
                };
                Self {
                    proxy_enabled: row.proxy_enabled,
                    pinned,
                }
            }
        }
    }
}

/// Build the ordered candidate list for one fetch.
///
/// - proxying disabled: a single direct connection.
/// - pinned endpoint enabled: pinned first, remaining enabled endpoints
///   by ascending id as failover.
/// - auto: all enabled endpoints by ascending id, ties broken by lower
///   recorded response time.
///
/// Proxying enabled with nothing configured yields no candidates; the
/// caller surfaces that as no_route rather than silently going direct.
pub fn select(
    policy: &SelectionPolicy,
    endpoints: &[proxy_endpoint::Model],
    health: &HashMap<EndpointKey, EndpointHealth>,
) -> Vec<Candidate> {
    if !policy.proxy_enabled {
        return vec![Candidate::Direct];
    }

    let mut specs: Vec<ProxySpec> = endpoints
        .iter()
        .filter(|model| model.enabled)
        .filter_map(ProxySpec::from_model)
        .collect();

    specs.sort_by(|a, b| {
        a.id.cmp(&b.id)
            .then_with(|| compare_rtt(health, a.key(), b.key()))
    });

    if let Some(pinned) = policy.pinned {
        if let Some(pos) = specs.iter().position(|spec| spec.key() == pinned) {
            let front = specs.remove(pos);
            specs.insert(0, front);
        }
    }

    specs.into_iter().map(Candidate::Tunnel).collect()
}

fn compare_rtt(
    health: &HashMap<EndpointKey, EndpointHealth>,
    a: EndpointKey,
    b: EndpointKey,
) -> Ordering {
    let rtt = |key: EndpointKey| health.get(&key).and_then(|entry| entry.avg_response_ms);
    match (rtt(a), rtt(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn endpoint(n: u128, kind: &str, enabled: bool) -> proxy_endpoint::Model {
        proxy_endpoint::Model {
            id: Uuid::from_u128(n),
            kind: kind.to_string(),
            name: format!("proxy-{n}"),
            host: format!("host-{n}"),
            port: 1080,
            username: None,
            password: None,
            enabled,
            success_count: 0,
            fail_count: 0,
            avg_response_ms: None,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<Uuid> {
        candidates
            .iter()
            .map(|c| match c {
                Candidate::Tunnel(spec) => spec.id,
                Candidate::Direct => panic!("unexpected direct candidate"),
            })
            .collect()
    }

    #[test]
    fn direct_only_when_proxying_disabled() {
        let policy = SelectionPolicy {
            proxy_enabled: false,
            pinned: Some((ProxyKind::Http, Uuid::from_u128(1))),
        };
        let endpoints = vec![endpoint(1, "http", true)];
        let candidates = select(&policy, &endpoints, &HashMap::new());
        assert_eq!(candidates.len(), 1);
        assert!(matches!(candidates[0], Candidate::Direct));
    }

    #[test]
    fn auto_orders_by_ascending_id_and_skips_disabled() {
        let policy = SelectionPolicy {
            proxy_enabled: true,
            pinned: None,
        };
        let endpoints = vec![
            endpoint(3, "socks5", true),
            endpoint(1, "http", true),
            endpoint(2, "http", false),
        ];
        let candidates = select(&policy, &endpoints, &HashMap::new());
        assert_eq!(ids(&candidates), vec![Uuid::from_u128(1), Uuid::from_u128(3)]);
    }

    #[test]
    fn pinned_endpoint_goes_first_with_failover_tail() {
        let policy = SelectionPolicy {
            proxy_enabled: true,
            pinned: Some((ProxyKind::Socks5, Uuid::from_u128(3))),
        };
        let endpoints = vec![
            endpoint(1, "http", true),
            endpoint(2, "http", true),
            endpoint(3, "socks5", true),
        ];
        let candidates = select(&policy, &endpoints, &HashMap::new());
        assert_eq!(
            ids(&candidates),
            vec![Uuid::from_u128(3), Uuid::from_u128(1), Uuid::from_u128(2)]
        );
    }

    #[test]
    fn disabled_pin_falls_back_to_auto_order() {
        let policy = SelectionPolicy {
            proxy_enabled: true,
            pinned: Some((ProxyKind::Http, Uuid::from_u128(2))),
        };
        let endpoints = vec![
            endpoint(1, "http", true),
            endpoint(2, "http", false),
            endpoint(3, "http", true),
        ];
        let candidates = select(&policy, &endpoints, &HashMap::new());
        assert_eq!(ids(&candidates), vec![Uuid::from_u128(1), Uuid::from_u128(3)]);
    }

    #[test]
    fn faster_endpoint_does_not_outrank_a_lower_id() {
        use crate::proxy::health::{EndpointHealth, Health};

        let policy = SelectionPolicy {
            proxy_enabled: true,
            pinned: None,
        };
        let endpoints = vec![endpoint(1, "http", true), endpoint(2, "http", true)];
        let mut health = HashMap::new();
        health.insert(
            (ProxyKind::Http, Uuid::from_u128(2)),
            EndpointHealth {
                kind: ProxyKind::Http,
                id: Uuid::from_u128(2),
                name: "proxy-2".to_string(),
                enabled: true,
                success_count: 4,
                fail_count: 0,
                consecutive_failures: 0,
                avg_response_ms: Some(55.0),
                last_checked_at: None,
                health: Health::Healthy,
            },
        );
        // Id order is the primary key; recorded latency only breaks ties.
        let candidates = select(&policy, &endpoints, &health);
        assert_eq!(ids(&candidates), vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }

    #[test]
    fn enabled_proxying_without_endpoints_yields_no_candidates() {
        let policy = SelectionPolicy {
            proxy_enabled: true,
            pinned: None,
        };
        let candidates = select(&policy, &[], &HashMap::new());
        assert!(candidates.is_empty());
    }
}
