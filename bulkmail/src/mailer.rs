//! Transport used by the command-line driver
//!
//! Nothing leaves the machine: every send is logged and counted. Addresses
//! listed as bounces in the fixture come back as bounced.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use ahash::AHashSet;
use async_trait::async_trait;
use bulkmail_common::dispatch;
use bulkmail_dispatch::{Mailer, MessageRef, SendOutcome};

/// Mailer that logs instead of sending
#[derive(Debug, Default)]
pub struct LogMailer {
    bounces: AHashSet<String>,
    latency: Option<Duration>,
    sent: AtomicUsize,
}

impl LogMailer {
    #[must_use]
    pub fn new(bounces: impl IntoIterator<Item = String>) -> Self {
        Self {
            bounces: bounces.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Simulated time spent talking to the transport, per message
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Messages handed over so far
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MessageRef, address: &str) -> SendOutcome {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.sent.fetch_add(1, Ordering::Relaxed);

        if self.bounces.contains(address) {
            dispatch!(level = INFO, address, subject = %message.subject, "Bounced");
            return SendOutcome::Bounced(format!("550 {address}: mailbox unavailable"));
        }

        dispatch!(level = INFO, address, subject = %message.subject, "Sent");
        SendOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> MessageRef {
        MessageRef {
            subject: "Hello".to_string(),
            body: "hello.html".to_string(),
        }
    }

    #[tokio::test]
    async fn test_listed_addresses_bounce() {
        let mailer = LogMailer::new(["gone@example.org".to_string()]);

        assert_eq!(
            mailer.send(&message(), "here@example.org").await,
            SendOutcome::Delivered
        );
        assert!(matches!(
            mailer.send(&message(), "gone@example.org").await,
            SendOutcome::Bounced(_)
        ));
        assert_eq!(mailer.sent(), 2);
    }
}
