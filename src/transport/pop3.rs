use chrono::{DateTime, Utc};
use futures::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::error::TransportError;
use crate::transport::message;
use crate::transport::stream::MailStream;
use crate::transport::FetchBatch;

/// Minimal POP3 client: USER/PASS, STAT, RETR, QUIT. That is the whole
/// surface this service needs, so no external client crate.
pub struct Pop3Mailbox {
    reader: BufReader<ReadHalf<MailStream>>,
    writer: WriteHalf<MailStream>,
}

impl Pop3Mailbox {
    pub async fn login(
        stream: MailStream,
        username: &str,
        password: &str,
    ) -> Result<Self, TransportError> {
        let (read_half, write_half) = stream.split();
        let mut mailbox = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = mailbox.read_line().await?;
        if !greeting.starts_with("+OK") {
            return Err(TransportError::Protocol(format!(
                "unexpected POP3 greeting: {greeting}"
            )));
        }

        let user_reply = mailbox.command(&format!("USER {username}")).await?;
        if !user_reply.starts_with("+OK") {
            return Err(TransportError::AuthFailed(user_reply));
        }
        let pass_reply = mailbox.command(&format!("PASS {password}")).await?;
        if !pass_reply.starts_with("+OK") {
            return Err(TransportError::AuthFailed(pass_reply));
        }

        Ok(mailbox)
    }

    /// Walk the mailbox newest-first and keep messages inside the
    /// window. POP3 has no server-side date search, so every message is
    /// retrieved and filtered client-side.
    pub async fn fetch_since(
        &mut self,
        floor: DateTime<Utc>,
        allowlist: &[String],
    ) -> Result<FetchBatch, TransportError> {
        let stat = self.command("STAT").await?;
        let count = parse_stat_count(&stat)?;

        let mut batch = FetchBatch::default();
        for number in (1..=count).rev() {
            let raw = self.retrieve(number).await?;
            let record = match message::normalize(&raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(message = number, "skipping unparseable message: {err}");
                    batch.parse_failures += 1;
                    continue;
                }
            };
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
        self.command("QUIT").await.map(|_| ())
    }

    /// RETR one message, undoing POP3 dot-stuffing.
    async fn retrieve(&mut self, number: u32) -> Result<Vec<u8>, TransportError> {
        let reply = self.command(&format!("RETR {number}")).await?;
        if !reply.starts_with("+OK") {
            return Err(TransportError::Protocol(format!("RETR {number}: {reply}")));
        }

        let mut raw = Vec::new();
        loop {
            let line = self.read_raw_line().await?;
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            if let Some(rest) = line.strip_prefix(b".".as_slice()) {
                if rest.starts_with(b".") {
                    raw.extend_from_slice(rest);
                    continue;
                }
            }
            raw.extend_from_slice(&line);
        }
        Ok(raw)
    }

    async fn command(&mut self, line: &str) -> Result<String, TransportError> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|err| TransportError::Protocol(format!("write failed: {err}")))?;
        self.writer
            .flush()
            .await
            .map_err(|err| TransportError::Protocol(format!("flush failed: {err}")))?;
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let raw = self.read_raw_line().await?;
        Ok(String::from_utf8_lossy(&raw).trim_end().to_string())
    }

    // Bodies are arbitrary bytes, so lines are read raw and only decoded
    // where a status line is expected.
    async fn read_raw_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|err| TransportError::Protocol(format!("read failed: {err}")))?;
        if n == 0 {
            return Err(TransportError::Protocol(
                "server closed the connection".to_string(),
            ));
        }
        Ok(line)
    }
}

fn parse_stat_count(reply: &str) -> Result<u32, TransportError> {
    if !reply.starts_with("+OK") {
        return Err(TransportError::Protocol(format!("STAT: {reply}")));
    }
    reply
        .split_whitespace()
        .nth(1)
        .and_then(|count| count.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("malformed STAT reply: {reply}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_count_parses() {
        assert_eq!(parse_stat_count("+OK 3 4200").unwrap(), 3);
        assert_eq!(parse_stat_count("+OK 0 0").unwrap(), 0);
        assert!(parse_stat_count("-ERR no").is_err());
        assert!(parse_stat_count("+OK").is_err());
    }
}
