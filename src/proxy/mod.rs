pub mod health;
pub mod selector;
pub mod tunnel;

use serde::Serialize;
use uuid::Uuid;

use crate::db::entities::proxy_endpoint;

/// Tunnel protocol of a configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(ProxyKind::Http),
            "socks5" => Some(ProxyKind::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key. Both kinds live in one registry, keyed by (kind, id).
pub type EndpointKey = (ProxyKind, Uuid);

/// Everything needed to open one tunnel.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    pub fn key(&self) -> EndpointKey {
        (self.kind, self.id)
    }

    /// Returns None when the stored kind string or port is malformed.
    pub fn from_model(model: &proxy_endpoint::Model) -> Option<Self> {
        Some(Self {
            kind: ProxyKind::parse(&model.kind)?,
            id: model.id,
            host: model.host.clone(),
            port: u16::try_from(model.port).ok()?,
            username: model.username.clone(),
            password: model.password.clone(),
        })
    }
}

/// One connection option, tried in order during a fetch.
#[derive(Debug, Clone)]
pub enum Candidate {
    Direct,
    Tunnel(ProxySpec),
}

impl Candidate {
    pub fn describe(&self) -> String {
        match self {
            Candidate::Direct => "direct".to_string(),
            Candidate::Tunnel(spec) => format!("{} {}:{}", spec.kind, spec.host, spec.port),
        }
    }
}
