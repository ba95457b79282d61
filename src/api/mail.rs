//! Mail API: inbox listing and full message fetch

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use super::client::MailClient;
use super::code;

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    snippet: Option<String>,
    /// Epoch milliseconds, sent as a string
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<Payload>,
}

/// One MIME part; the top-level payload is the root of the tree.
#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Payload>,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    /// base64url, usually unpadded
    data: Option<String>,
}

impl Payload {
    /// Readable text of this part, or of its children joined by newlines.
    fn text(&self) -> String {
        let data = self.body.as_ref().and_then(|b| b.data.as_deref());
        let mime_type = self.mime_type.as_deref().map(str::to_ascii_lowercase);
        match (mime_type.as_deref(), data) {
            (Some("text/plain"), Some(data)) => return decode_body(data),
            (Some("text/html"), Some(data)) => return code::strip_html(&decode_body(data)),
            _ => {}
        }

        let mut text = String::new();
        for part in &self.parts {
            text.push_str(&part.text());
            text.push('\n');
        }
        text
    }
}

fn decode_body(data: &str) -> String {
    match URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::debug!("Skipping undecodable message part: {}", e);
            String::new()
        }
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

/// Message summary for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
    /// Decoded body text, or the snippet when the body has none.
    pub text: String,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MessageSummary {
    /// One-time code in this message, if it looks like a code mail.
    pub fn verification_code(&self) -> Option<String> {
        if !code::is_likely_code_mail(&self.from, &self.subject) {
            return None;
        }
        code::find_code(&self.text)
    }
}

impl From<MessageResponse> for MessageSummary {
    fn from(msg: MessageResponse) -> Self {
        let payload = msg.payload.unwrap_or_default();
        let snippet = msg.snippet.unwrap_or_default();
        let text = match payload.text() {
            t if t.trim().is_empty() => snippet.clone(),
            t => t,
        };
        let headers = payload.headers;
        let header = |name: &str| {
            headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
                .unwrap_or_default()
        };
        let received_at = msg
            .internal_date
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(chrono::DateTime::from_timestamp_millis);

        Self {
            from: header("From"),
            subject: header("Subject"),
            id: msg.id,
            snippet,
            text,
            received_at,
        }
    }
}

/// Most recent inbox messages, newest first.
pub async fn list_inbox(client: &MailClient, max: u32) -> Result<Vec<MessageRef>> {
    let path = format!("/users/me/messages?maxResults={}&labelIds=INBOX", max);
    let resp = client.get(&path).await?;
    let list: MessageList = resp
        .json()
        .await
        .context("Failed to parse message list")?;
    Ok(list.messages)
}

/// Fetch a message with its headers and decoded body text.
pub async fn get_message(client: &MailClient, id: &str) -> Result<MessageSummary> {
    let path = format!("/users/me/messages/{}?format=full", id);
    let resp = client.get(&path).await?;
    let msg: MessageResponse = resp
        .json()
        .await
        .with_context(|| format!("Failed to parse message {}", id))?;
    Ok(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::tests::signed_in;
    use chrono::TimeZone;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    #[tokio::test]
    async fn test_list_inbox() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/users/me/messages")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("maxResults".into(), "5".into()),
                Matcher::UrlEncoded("labelIds".into(), "INBOX".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"messages":[{"id":"m2","threadId":"t2"},{"id":"m1","threadId":"t1"}],
                    "resultSizeEstimate":2}"#,
            )
            .create_async()
            .await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        let ids: Vec<_> = list_inbox(&client, 5)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[tokio::test]
    async fn test_empty_inbox_has_no_messages_field() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"resultSizeEstimate":0}"#)
            .create_async()
            .await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        assert!(list_inbox(&client, 5).await.unwrap().is_empty());
    }

    fn encoded(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text)
    }

    #[tokio::test]
    async fn test_get_message() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/users/me/messages/m1")
            .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
            .with_status(200)
            .with_body(
                r#"{
                    "id": "m1",
                    "snippet": "Your code is 482913",
                    "internalDate": "1740819600000",
                    "payload": {"headers": [
                        {"name": "From", "value": "GitHub <noreply@github.com>"},
                        {"name": "Subject", "value": "Your verification code"}
                    ]}
                }"#,
            )
            .create_async()
            .await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        let summary = get_message(&client, "m1").await.unwrap();

        assert_eq!(summary.from, "GitHub <noreply@github.com>");
        assert_eq!(summary.subject, "Your verification code");
        assert_eq!(summary.snippet, "Your code is 482913");
        // No body parts: the snippet stands in for the text.
        assert_eq!(summary.text, "Your code is 482913");
        assert_eq!(summary.verification_code().as_deref(), Some("482913"));
        assert_eq!(
            summary.received_at,
            Some(chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_multipart_body_is_decoded() {
        let msg: MessageResponse = serde_json::from_value(serde_json::json!({
            "id": "m3",
            "snippet": "Sign in to Example",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "Example <no-reply@example.com>"},
                    {"name": "Subject", "value": "Sign in to Example"}
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": encoded("Use 7731 ~ to sign in?")}},
                    {"mimeType": "text/html", "body": {"data": format!("{}==", encoded(
                        "<style>.x { width: 100200px }</style><p>Code:</p><b>7731</b>"
                    ))}}
                ]
            }
        }))
        .unwrap();

        let summary = MessageSummary::from(msg);
        assert!(summary.text.contains("Use 7731 ~ to sign in?"));
        assert!(!summary.text.contains("100200"));
        assert!(!summary.text.contains("<b>"));
        assert_eq!(summary.verification_code().as_deref(), Some("7731"));
    }

    #[test]
    fn test_unlikely_sender_has_no_code() {
        let msg: MessageResponse = serde_json::from_value(serde_json::json!({
            "id": "m4",
            "snippet": "Meet at 1430 in room 2207",
            "payload": {"headers": [
                {"name": "From", "value": "Alice <alice@example.org>"},
                {"name": "Subject", "value": "Standup"}
            ]}
        }))
        .unwrap();

        assert_eq!(MessageSummary::from(msg).verification_code(), None);
    }
}
