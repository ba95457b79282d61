//! Mail API module: authenticated client and the inbox watcher

pub mod client;
mod code;
mod mail;

use anyhow::Result;
use std::collections::HashSet;
use tokio::time::{self, MissedTickBehavior};

use crate::auth::{AuthError, RenewalScheduler, Session};
use crate::config::Settings;
use client::MailClient;
use mail::MessageSummary;

/// One-time code found in the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub code: String,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    /// `From - Subject` of the carrying message
    pub source: String,
}

/// Tracks which inbox messages and codes have already been reported.
pub struct InboxWatcher {
    client: MailClient,
    max_messages: u32,
    seen: Option<HashSet<String>>,
    last_code: Option<String>,
}

impl InboxWatcher {
    pub fn new(client: MailClient, max_messages: u32) -> Self {
        Self {
            client,
            max_messages,
            seen: None,
            last_code: None,
        }
    }

    /// Newest verification code among `messages`, unless it is the code
    /// reported last time.
    pub fn new_code(&mut self, messages: &[MessageSummary]) -> Option<VerificationCode> {
        let newest = messages
            .iter()
            .filter_map(|m| m.verification_code().map(|code| (m, code)))
            .max_by_key(|(m, _)| m.received_at)?;

        let (message, code) = newest;
        if self.last_code.as_deref() == Some(code.as_str()) {
            return None;
        }
        self.last_code = Some(code.clone());
        Some(VerificationCode {
            code,
            received_at: message.received_at,
            source: format!("{} - {}", message.from, message.subject),
        })
    }

    /// Fetch the inbox and return messages not seen by an earlier poll.
    /// The first successful poll only records what is already there.
    pub async fn poll(&mut self) -> Result<Vec<MessageSummary>> {
        let messages = mail::list_inbox(&self.client, self.max_messages).await?;

        let Some(seen) = self.seen.as_mut() else {
            tracing::info!("Watching inbox ({} recent messages)", messages.len());
            self.seen = Some(messages.into_iter().map(|m| m.id).collect());
            return Ok(Vec::new());
        };

        let mut fresh = Vec::new();
        for message in messages {
            if seen.contains(&message.id) {
                continue;
            }
            match mail::get_message(&self.client, &message.id).await {
                Ok(summary) => {
                    seen.insert(message.id);
                    fresh.push(summary);
                }
                // Retried on the next poll
                Err(e) => tracing::warn!("Failed to fetch message {}: {:#}", message.id, e),
            }
        }
        Ok(fresh)
    }
}

/// Poll the inbox until Ctrl+C, renewing the token in the background.
pub async fn watch(settings: &Settings, session: &Session) -> Result<()> {
    let client = MailClient::new(
        session.manager.clone(),
        &settings.api_base,
        std::time::Duration::from_secs(settings.request_timeout_secs),
    )?;
    let mut watcher = InboxWatcher::new(client, settings.max_messages);

    if !session.manager.is_logged_in() {
        println!("{}", AuthError::AuthenticationRequired.user_message());
    }
    let renewal =
        RenewalScheduler::new(session.manager.clone(), settings.renewal_interval()).spawn();

    // Polls run inline, so a slow poll delays the next instead of overlapping it.
    let mut ticker = time::interval(settings.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    println!("Watching inbox every {}s. Press Ctrl+C to stop.", settings.poll_interval_secs);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match watcher.poll().await {
                    Ok(messages) => {
                        for m in &messages {
                            tracing::info!("New message {}", m.id);
                            println!("{}  {}  {}", m.from, m.subject, m.snippet);
                        }
                        if let Some(found) = watcher.new_code(&messages) {
                            tracing::info!("Verification code detected in {}", found.source);
                            println!("New code detected: {}  ({})", found.code, found.source);
                        }
                    }
                    Err(e) => match e.downcast_ref::<AuthError>() {
                        Some(auth) => tracing::warn!("Poll skipped: {}", auth.user_message()),
                        None => tracing::warn!("Poll failed: {:#}", e),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watcher");
                break;
            }
        }
    }

    renewal.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::tests::signed_in;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;

    async fn inbox(server: &mut ServerGuard, ids: &[&str]) -> mockito::Mock {
        let messages: Vec<_> = ids
            .iter()
            .map(|id| serde_json::json!({"id": id, "threadId": id}))
            .collect();
        server
            .mock("GET", "/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(serde_json::json!({ "messages": messages }).to_string())
            .create_async()
            .await
    }

    async fn message(server: &mut ServerGuard, id: &str, subject: &str) -> mockito::Mock {
        server
            .mock("GET", format!("/users/me/messages/{}", id).as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": id,
                    "snippet": "",
                    "payload": {"headers": [{"name": "Subject", "value": subject}]}
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    fn summary(id: &str, subject: &str, text: &str, minute: u32) -> MessageSummary {
        use chrono::TimeZone;
        MessageSummary {
            id: id.into(),
            from: "Example <no-reply@example.com>".into(),
            subject: subject.into(),
            snippet: String::new(),
            text: text.into(),
            received_at: Some(chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_newest_code_reported_once() {
        let (manager, _) = signed_in();
        let client = MailClient::new(manager, "http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        let mut watcher = InboxWatcher::new(client, 5);

        let batch = vec![
            summary("m1", "Your login code", "Your code is 111111", 1),
            summary("m2", "Your login code", "Your code is 222222", 5),
            summary("m3", "Weekly digest", "Nothing to see", 9),
        ];
        let found = watcher.new_code(&batch).unwrap();
        assert_eq!(found.code, "222222");
        assert_eq!(found.source, "Example <no-reply@example.com> - Your login code");

        // Same code again is not news.
        assert_eq!(watcher.new_code(&batch[1..2]), None);
        assert_eq!(watcher.new_code(&[]), None);

        let next = watcher
            .new_code(&[summary("m4", "Your login code", "Your code is 333333", 12)])
            .unwrap();
        assert_eq!(next.code, "333333");
    }

    #[tokio::test]
    async fn test_first_poll_only_records_inbox() {
        let mut server = Server::new_async().await;
        inbox(&mut server, &["m1"]).await;
        let detail = server
            .mock("GET", "/users/me/messages/m1")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        let mut watcher = InboxWatcher::new(client, 5);

        assert!(watcher.poll().await.unwrap().is_empty());
        detail.assert_async().await;
    }

    #[tokio::test]
    async fn test_new_messages_reported_once() {
        let mut server = Server::new_async().await;
        let first = inbox(&mut server, &["m1"]).await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        let mut watcher = InboxWatcher::new(client, 5);
        watcher.poll().await.unwrap();
        first.remove_async().await;

        inbox(&mut server, &["m2", "m1"]).await;
        message(&mut server, "m2", "Your code").await;

        let fresh = watcher.poll().await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "m2");
        assert_eq!(fresh[0].subject, "Your code");

        assert!(watcher.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_error_keeps_state() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let (manager, _) = signed_in();
        let client = MailClient::new(manager, &server.url(), Duration::from_secs(5)).unwrap();
        let mut watcher = InboxWatcher::new(client, 5);
        assert!(watcher.poll().await.is_err());
        failing.remove_async().await;

        // The failed poll did not count as the seeding poll
        inbox(&mut server, &["m1"]).await;
        assert!(watcher.poll().await.unwrap().is_empty());
    }
}
