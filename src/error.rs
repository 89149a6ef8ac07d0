use std::time::Duration;

use thiserror::Error;

/// Why the ledger refused a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    Disabled,
    Expired,
    Exhausted,
}

impl RejectReason {
    /// Stable code string, also used in audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NotFound => "card_not_found",
            RejectReason::Disabled => "card_disabled",
            RejectReason::Expired => "card_expired",
            RejectReason::Exhausted => "card_exhausted",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::NotFound => "card key not found",
            RejectReason::Disabled => "card has been disabled",
            RejectReason::Expired => "card has expired",
            RejectReason::Exhausted => "card usage limit reached",
        }
    }
}

/// Failure of a single fetch attempt at the transport layer.
///
/// Everything except `AuthFailed` is eligible for proxy failover.
/// `AuthFailed` means the tunnel reached the mail server and the server
/// rejected the mailbox credentials, so trying another tunnel cannot help.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy tunnel failed: {0}")]
    Tunnel(String),
    #[error("TLS handshake failed: {0}")]
    Tls(#[from] async_native_tls::Error),
    #[error("authentication rejected by mail server: {0}")]
    AuthFailed(String),
    #[error("mail protocol error: {0}")]
    Protocol(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether the next proxy candidate should be tried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::AuthFailed(_))
    }
}

/// Errors out of `CardLedger::redeem`.
#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("{}", .0.message())]
    Rejected(RejectReason),
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// Terminal outcomes of `redeem_and_fetch`, surfaced to the API layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{}", .0.message())]
    CardRejected(RejectReason),
    #[error("bound mail account is missing or disabled")]
    AccountUnavailable,
    #[error("mailbox authentication failed: {0}")]
    AuthFailed(String),
    #[error("no proxy candidate could reach the mail server")]
    NoRoute,
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

impl FetchError {
    /// Stable error code for the wire and for audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::CardRejected(reason) => reason.code(),
            FetchError::AccountUnavailable => "account_unavailable",
            FetchError::AuthFailed(_) => "auth_failed",
            FetchError::NoRoute => "no_route",
            FetchError::Db(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_not_retryable() {
        assert!(!TransportError::AuthFailed("LOGIN failed".into()).is_retryable());
        assert!(TransportError::Tunnel("refused".into()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn reject_codes_are_stable() {
        assert_eq!(RejectReason::NotFound.code(), "card_not_found");
        assert_eq!(RejectReason::Exhausted.code(), "card_exhausted");
        assert_eq!(
            FetchError::CardRejected(RejectReason::Expired).code(),
            "card_expired"
        );
        assert_eq!(FetchError::NoRoute.code(), "no_route");
    }
}
