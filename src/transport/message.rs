use chrono::{DateTime, TimeZone, Utc};
use mailparse::{addrparse, dateparse, DispositionType, MailHeaderMap, ParsedMail};
use serde::Serialize;

/// One normalized message, independent of the protocol it came over.
#[derive(Debug, Clone, Serialize)]
pub struct MailRecord {
    pub subject: String,
    pub from: String,
    pub from_addr: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub body: String,
    pub attachments: Vec<AttachmentInfo>,
}

/// Attachment listing only; payloads are never returned.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub size: usize,
    pub mime_type: String,
}

/// Parse a raw RFC 2822 message into a `MailRecord`.
pub fn normalize(raw: &[u8]) -> Result<MailRecord, mailparse::MailParseError> {
    let parsed = mailparse::parse_mail(raw)?;

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let from = parsed.headers.get_first_value("From").unwrap_or_default();
    let to = parsed.headers.get_first_value("To").unwrap_or_default();

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| dateparse(&value).ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());

    let mut text_body = None;
    let mut html_body = None;
    let mut attachments = Vec::new();
    collect(&parsed, &mut text_body, &mut html_body, &mut attachments);

    // HTML wins when both parts are present; verification mails usually
    // carry their links only in the HTML part.
    let body = html_body.or(text_body).unwrap_or_default();

    Ok(MailRecord {
        subject,
        from_addr: extract_addr(&from),
        from,
        to,
        date,
        body,
        attachments,
    })
}

fn collect(
    part: &ParsedMail<'_>,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect(sub, text_body, html_body, attachments);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition.params.get("filename").cloned();
    let mimetype = part.ctype.mimetype.to_lowercase();

    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (filename.is_some() && !mimetype.starts_with("text/"));
    if is_attachment {
        let size = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
        attachments.push(AttachmentInfo {
            filename: filename.unwrap_or_else(|| "unnamed".to_string()),
            size,
            mime_type: part.ctype.mimetype.clone(),
        });
        return;
    }

    let body = decoded_body(part);
    if mimetype == "text/html" {
        if html_body.is_none() {
            *html_body = Some(body);
        }
    } else if text_body.is_none() {
        *text_body = Some(body);
    }
}

/// Charset-decoded body, falling back to lossy UTF-8 of the raw bytes
/// when the declared charset is unusable.
fn decoded_body(part: &ParsedMail<'_>) -> String {
    match part.get_body() {
        Ok(body) => body,
        Err(_) => part
            .get_body_raw()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default(),
    }
}

/// Bare address out of a From header ("Alice <a@x.io>" yields "a@x.io").
fn extract_addr(header: &str) -> String {
    match addrparse(header) {
        Ok(list) => list
            .extract_single_info()
            .map(|info| info.addr)
            .unwrap_or_else(|| header.trim().to_string()),
        Err(_) => header.trim().to_string(),
    }
}

/// Case-insensitive exact match against the allowlist. An empty
/// allowlist admits every sender.
pub fn sender_allowed(from_addr: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(from_addr.trim()))
}

/// Whether a message dated `date` falls inside the lookback window.
/// Undated messages are excluded; the floor itself is inclusive.
pub fn within_window(date: Option<DateTime<Utc>>, floor: DateTime<Utc>) -> bool {
    matches!(date, Some(d) if d >= floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SIMPLE: &[u8] = b"From: Alice Example <alice@example.com>\r\n\
To: inbox@service.test\r\n\
Subject: Your code\r\n\
Date: Mon, 10 Mar 2025 12:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Code: 123456\r\n";

    const MULTIPART: &[u8] = b"From: noreply@shop.test\r\n\
To: inbox@service.test\r\n\
Subject: Receipt\r\n\
Date: Mon, 10 Mar 2025 12:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain receipt\r\n\
--outer\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html receipt</p>\r\n\
--outer\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"receipt.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--outer--\r\n";

    #[test]
    fn parses_simple_message() {
        let record = normalize(SIMPLE).unwrap();
        assert_eq!(record.subject, "Your code");
        assert_eq!(record.from_addr, "alice@example.com");
        assert_eq!(record.to, "inbox@service.test");
        assert!(record.body.contains("123456"));
        assert!(record.date.is_some());
        assert!(record.attachments.is_empty());
    }

    #[test]
    fn html_part_wins_and_attachments_are_listed() {
        let record = normalize(MULTIPART).unwrap();
        assert!(record.body.contains("html receipt"));
        assert_eq!(record.attachments.len(), 1);
        assert_eq!(record.attachments[0].filename, "receipt.pdf");
        assert_eq!(record.attachments[0].mime_type, "application/pdf");
        assert!(record.attachments[0].size > 0);
    }

    #[test]
    fn allowlist_is_case_insensitive_and_exact() {
        let allow = vec!["NoReply@Shop.test".to_string()];
        assert!(sender_allowed("noreply@shop.test", &allow));
        assert!(!sender_allowed("other@shop.test", &allow));
        assert!(!sender_allowed("noreply@shop.test.evil", &allow));
        assert!(sender_allowed("anyone@anywhere.test", &[]));
    }

    #[test]
    fn window_floor_is_inclusive_and_undated_excluded() {
        let floor = Utc::now() - Duration::days(1);
        assert!(within_window(Some(floor), floor));
        assert!(within_window(Some(floor + Duration::seconds(1)), floor));
        assert!(!within_window(Some(floor - Duration::seconds(1)), floor));
        assert!(!within_window(None, floor));
    }
}
