pub mod imap;
pub mod message;
pub mod pop3;
pub mod stream;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::entities::mail_account;
use crate::error::TransportError;
use crate::proxy::{tunnel, Candidate};
use crate::transport::message::MailRecord;

/// Result of one mailbox read: the surviving records plus how many raw
/// messages failed to parse (skipped, never fatal).
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub records: Vec<MailRecord>,
    pub parse_failures: u32,
}

/// Per-card retrieval constraints, resolved at redemption time.
#[derive(Debug, Clone)]
pub struct FetchFilter {
    pub lookback_days: u32,
    pub sender_allowlist: Vec<String>,
}

/// Seam between the orchestrator and the real network. Production uses
/// `MailTransport`; failover tests script this trait instead.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn fetch(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
        filter: &FetchFilter,
    ) -> Result<FetchBatch, TransportError>;

    /// Connect and authenticate without reading mail.
    async fn test_connection(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailProtocol {
    Imap,
    Pop3,
}

impl MailProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "imap" => Some(MailProtocol::Imap),
            "pop3" => Some(MailProtocol::Pop3),
            _ => None,
        }
    }
}

enum MailSession {
    Imap(imap::ImapMailbox),
    Pop3(pop3::Pop3Mailbox),
}

impl MailSession {
    async fn fetch_since(
        &mut self,
        floor: chrono::DateTime<Utc>,
        allowlist: &[String],
    ) -> Result<FetchBatch, TransportError> {
        match self {
            MailSession::Imap(mailbox) => mailbox.fetch_since(floor, allowlist).await,
            MailSession::Pop3(mailbox) => mailbox.fetch_since(floor, allowlist).await,
        }
    }

    async fn logout(self) -> Result<(), TransportError> {
        match self {
            MailSession::Imap(mailbox) => mailbox.logout().await,
            MailSession::Pop3(mailbox) => mailbox.logout().await,
        }
    }
}

/// The real transport: tunnel, TLS, protocol login, fetch.
pub struct MailTransport {
    connect_timeout: Duration,
    attempt_timeout: Duration,
}

impl MailTransport {
    pub fn new(connect_timeout: Duration, attempt_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            attempt_timeout,
        }
    }

    async fn open_session(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
    ) -> Result<MailSession, TransportError> {
        let protocol = MailProtocol::parse(&account.protocol).ok_or_else(|| {
            TransportError::Protocol(format!("unsupported protocol {:?}", account.protocol))
        })?;
        let port = u16::try_from(account.port)
            .map_err(|_| TransportError::Protocol(format!("invalid port {}", account.port)))?;

        let tunnel =
            tunnel::open(candidate, &account.server, port, self.connect_timeout).await?;
        let stream = stream::secure(tunnel, &account.server, account.use_ssl).await?;

        match protocol {
            MailProtocol::Imap => {
                let mailbox =
                    imap::ImapMailbox::login(stream, &account.username, &account.password).await?;
                Ok(MailSession::Imap(mailbox))
            }
            MailProtocol::Pop3 => {
                let mailbox =
                    pop3::Pop3Mailbox::login(stream, &account.username, &account.password).await?;
                Ok(MailSession::Pop3(mailbox))
            }
        }
    }

    async fn fetch_inner(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
        filter: &FetchFilter,
    ) -> Result<FetchBatch, TransportError> {
        let floor = Utc::now() - chrono::Duration::days(i64::from(filter.lookback_days));
        let mut session = self.open_session(account, candidate).await?;
        let result = session.fetch_since(floor, &filter.sender_allowlist).await;
        // A failed logout never outranks the fetch result.
        if let Err(err) = session.logout().await {
            tracing::debug!(account = %account.email, "logout failed: {err}");
        }
        result
    }
}

#[async_trait]
impl MailFetcher for MailTransport {
    async fn fetch(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
        filter: &FetchFilter,
    ) -> Result<FetchBatch, TransportError> {
        tokio::time::timeout(self.attempt_timeout, self.fetch_inner(account, candidate, filter))
            .await
            .map_err(|_| TransportError::Timeout(self.attempt_timeout))?
    }

    async fn test_connection(
        &self,
        account: &mail_account::Model,
        candidate: &Candidate,
    ) -> Result<(), TransportError> {
        let attempt = async {
            let session = self.open_session(account, candidate).await?;
            if let Err(err) = session.logout().await {
                tracing::debug!(account = %account.email, "logout failed: {err}");
            }
            Ok(())
        };
        tokio::time::timeout(self.attempt_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout(self.attempt_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_is_case_insensitive() {
        assert_eq!(MailProtocol::parse("IMAP"), Some(MailProtocol::Imap));
        assert_eq!(MailProtocol::parse("pop3"), Some(MailProtocol::Pop3));
        assert_eq!(MailProtocol::parse("smtp"), None);
    }
}
