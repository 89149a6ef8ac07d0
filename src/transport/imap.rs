use async_imap::Session;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::error::TransportError;
use crate::transport::message::{self, MailRecord};
use crate::transport::stream::MailStream;
use crate::transport::FetchBatch;

/// An authenticated IMAP session over an already-secured stream.
pub struct ImapMailbox {
    session: Session<MailStream>,
}

impl ImapMailbox {
    /// LOGIN with the account credentials. A rejected login maps to
    /// `AuthFailed`; transport problems during the exchange do not.
    pub async fn login(
        stream: MailStream,
        username: &str,
        password: &str,
    ) -> Result<Self, TransportError> {
        let client = async_imap::Client::new(stream);
        let session = client
            .login(username, password)
            .await
            .map_err(|(err, _client)| TransportError::AuthFailed(err.to_string()))?;
        Ok(Self { session })
    }

    /// Fetch messages received since `floor`, newest first.
    ///
    /// SINCE has date granularity, so the server over-returns up to a
    /// day; the precise window and the sender allowlist are applied
    /// client-side on the parsed records.
    pub async fn fetch_since(
        &mut self,
        floor: DateTime<Utc>,
        allowlist: &[String],
    ) -> Result<FetchBatch, TransportError> {
        self.session
            .select("INBOX")
            .await
            .map_err(|err| TransportError::Protocol(format!("SELECT INBOX: {err}")))?;

        let query = format!("SINCE {}", floor.format("%d-%b-%Y"));
        let mut uids: Vec<u32> = self
            .session
            .uid_search(&query)
            .await
            .map_err(|err| TransportError::Protocol(format!("UID SEARCH: {err}")))?
            .into_iter()
            .collect();
        uids.sort_unstable();

        let mut batch = FetchBatch::default();
        if uids.is_empty() {
            return Ok(batch);
        }

        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches: Vec<_> = {
            let stream = self
                .session
                .uid_fetch(&set, "(BODY[] INTERNALDATE)")
                .await
                .map_err(|err| TransportError::Protocol(format!("UID FETCH: {err}")))?;
            stream.collect().await
        };

        for fetch in fetches {
            let fetch = fetch.map_err(|err| TransportError::Protocol(format!("FETCH: {err}")))?;
            let Some(raw) = fetch.body() else {
                continue;
            };
            let mut record: MailRecord = match message::normalize(raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!("skipping unparseable message: {err}");
                    batch.parse_failures += 1;
                    continue;
                }
            };
            // INTERNALDATE is the server's receipt time and beats a
            // possibly forged Date header for windowing.
            if let Some(internal) = fetch.internal_date() {
                record.date = Some(internal.with_timezone(&Utc));
            }
            if !message::within_window(record.date, floor) {
                continue;
            }
            if !message::sender_allowed(&record.from_addr, allowlist) {
                continue;
            }
            batch.records.push(record);
        }

        batch.records.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(batch)
    }

    pub async fn logout(mut self) -> Result<(), TransportError> {
        self.session
            .logout()
            .await
            .map_err(|err| TransportError::Protocol(format!("LOGOUT: {err}")))
    }
}
