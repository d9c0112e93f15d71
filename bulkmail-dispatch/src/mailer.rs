//! Outbound transport seam
//!
//! Rendering and delivery of the actual message live outside the engine.
//! The engine hands the campaign's opaque message reference and a resolved
//! address to a [`Mailer`] and records whatever comes back.

use async_trait::async_trait;

use crate::{campaign::MessageRef, queue::Outcome};

/// Result of handing one message to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The transport reported a bounce for this address
    Bounced(String),
    /// The transport could not send at all
    Failed(String),
}

impl SendOutcome {
    /// Queue outcome recorded for this send
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Delivered => Outcome::Delivered,
            Self::Bounced(_) => Outcome::Bounced,
            Self::Failed(_) => Outcome::Failed,
        }
    }
}

/// Transport used to deliver one message to one address
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MessageRef, address: &str) -> SendOutcome;
}
