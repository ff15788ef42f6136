//! Closed catalog of CRM events that can be delivered to subscribers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version of the event catalog. Bumped whenever an event is added, renamed
/// or its payload contract changes.
pub const EVENT_CATALOG_VERSION: u32 = 1;

/// Webhook event types producers may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "contact.created")]
    ContactCreated,
    #[serde(rename = "contact.updated")]
    ContactUpdated,
    #[serde(rename = "contact.deleted")]
    ContactDeleted,
    #[serde(rename = "company.created")]
    CompanyCreated,
    #[serde(rename = "company.updated")]
    CompanyUpdated,
    #[serde(rename = "company.deleted")]
    CompanyDeleted,
    #[serde(rename = "deal.created")]
    DealCreated,
    #[serde(rename = "deal.updated")]
    DealUpdated,
    #[serde(rename = "deal.deleted")]
    DealDeleted,
    #[serde(rename = "deal.stage_changed")]
    DealStageChanged,
    #[serde(rename = "deal.won")]
    DealWon,
    #[serde(rename = "deal.lost")]
    DealLost,
    #[serde(rename = "quote.created")]
    QuoteCreated,
    #[serde(rename = "quote.sent")]
    QuoteSent,
    #[serde(rename = "quote.accepted")]
    QuoteAccepted,
    #[serde(rename = "quote.rejected")]
    QuoteRejected,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
}

impl WebhookEventType {
    /// Every event in the catalog.
    pub const ALL: [WebhookEventType; 18] = [
        Self::ContactCreated,
        Self::ContactUpdated,
        Self::ContactDeleted,
        Self::CompanyCreated,
        Self::CompanyUpdated,
        Self::CompanyDeleted,
        Self::DealCreated,
        Self::DealUpdated,
        Self::DealDeleted,
        Self::DealStageChanged,
        Self::DealWon,
        Self::DealLost,
        Self::QuoteCreated,
        Self::QuoteSent,
        Self::QuoteAccepted,
        Self::QuoteRejected,
        Self::TaskCreated,
        Self::TaskCompleted,
    ];

    /// Wire name used in the envelope and `X-Webhook-Event` header.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactCreated => "contact.created",
            Self::ContactUpdated => "contact.updated",
            Self::ContactDeleted => "contact.deleted",
            Self::CompanyCreated => "company.created",
            Self::CompanyUpdated => "company.updated",
            Self::CompanyDeleted => "company.deleted",
            Self::DealCreated => "deal.created",
            Self::DealUpdated => "deal.updated",
            Self::DealDeleted => "deal.deleted",
            Self::DealStageChanged => "deal.stage_changed",
            Self::DealWon => "deal.won",
            Self::DealLost => "deal.lost",
            Self::QuoteCreated => "quote.created",
            Self::QuoteSent => "quote.sent",
            Self::QuoteAccepted => "quote.accepted",
            Self::QuoteRejected => "quote.rejected",
            Self::TaskCreated => "task.created",
            Self::TaskCompleted => "task.completed",
        }
    }

    /// Parse a wire name. Returns `None` for names outside the catalog.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    /// The entity prefix (`"deal"` for `deal.won`).
    #[must_use]
    pub fn entity(&self) -> &'static str {
        let name = self.as_str();
        name.split_once('.').map_or(name, |(entity, _)| entity)
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown event type: {s}"))
    }
}
