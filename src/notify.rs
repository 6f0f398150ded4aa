//! Notification fan-out facade.
//!
//! The facade routes one message to the requested channels, skipping any
//! channel the recipient has no address for, and persists a delivery log
//! whatever the outcome. The channel backends themselves live outside the
//! core behind [`ChannelAdapter`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::stores::{AuditSink, AuditTopic, NotificationLogRecord};

/// Delivery channels the facade can fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Sms,
    Email,
    Webhook,
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Chat => "chat",
        }
    }
}

/// Message severity, in increasing order of urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Urgent,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }
}

/// Recipient roles the channel selection cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Driver,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Driver => "driver",
            Self::Customer => "customer",
        }
    }
}

/// A notification recipient with whatever addresses it has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub role: Role,
    pub push_token: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub chat_handle: Option<String>,
}

impl Recipient {
    /// A recipient with no addresses; channels will be skipped.
    pub fn bare(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            push_token: None,
            phone: None,
            email: None,
            webhook_url: None,
            chat_handle: None,
        }
    }

    /// Whether this recipient can be reached on `channel`.
    pub fn has_address_for(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push_token.is_some(),
            Channel::Sms => self.phone.is_some(),
            Channel::Email => self.email.is_some(),
            Channel::Webhook => self.webhook_url.is_some(),
            Channel::Chat => self.chat_handle.is_some(),
        }
    }
}

/// A notification to deliver.
#[derive(Debug, Clone)]
pub struct Message {
    pub title: String,
    pub body: String,
}

impl Message {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// One channel backend (push gateway, SMS provider, mail relay, ...).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, message: &Message)
        -> Result<(), DispatchError>;
}

/// Per-channel outcome of one fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOutcome {
    Delivered,
    Skipped,
    Failed(String),
}

/// Aggregated result of [`Notifier::send`].
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub results: Vec<(Channel, ChannelOutcome)>,
    /// True when at least one channel delivered.
    pub successful: bool,
}

/// Maximum body prefix length stored in the delivery log.
const BODY_PREFIX_MAX: usize = 100;

/// Fan-out facade over the registered channel adapters.
pub struct Notifier {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    sink: Arc<dyn AuditSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            adapters: HashMap::new(),
            sink,
        }
    }

    /// Registers the backend for one channel, replacing any previous one.
    pub fn with_adapter(mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(channel, adapter);
        self
    }

    /// Delivers `message` to `recipient` on each requested channel.
    ///
    /// A channel is skipped when the recipient has no address for it or no
    /// adapter is registered. Per-channel failures are captured, never
    /// propagated; the aggregated report and a delivery log record the
    /// outcome.
    pub async fn send(
        &self,
        recipient: &Recipient,
        message: &Message,
        severity: Severity,
        channels: &[Channel],
    ) -> DeliveryReport {
        let mut results = Vec::with_capacity(channels.len());

        for &channel in channels {
            let outcome = match self.adapters.get(&channel) {
                Some(adapter) if recipient.has_address_for(channel) => {
                    match adapter.deliver(recipient, message).await {
                        Ok(()) => ChannelOutcome::Delivered,
                        Err(err) => {
                            warn!(
                                channel = channel.as_str(),
                                recipient = %recipient.id,
                                error = %err,
                                "channel delivery failed"
                            );
                            ChannelOutcome::Failed(err.to_string())
                        }
                    }
                }
                _ => ChannelOutcome::Skipped,
            };
            results.push((channel, outcome));
        }

        let successful = results
            .iter()
            .any(|(_, outcome)| *outcome == ChannelOutcome::Delivered);

        self.persist_log(recipient, message, severity, &results, successful)
            .await;

        DeliveryReport {
            results,
            successful,
        }
    }

    /// Channels worth using for this recipient at this severity.
    ///
    /// Push whenever a token exists; SMS from urgent up; email only for
    /// critical; chat for admins. Already deduplicated.
    pub fn optimal_channels(recipient: &Recipient, severity: Severity) -> Vec<Channel> {
        let mut channels = Vec::new();
        if recipient.push_token.is_some() {
            channels.push(Channel::Push);
        }
        if severity >= Severity::Urgent && recipient.phone.is_some() {
            channels.push(Channel::Sms);
        }
        if severity == Severity::Critical && recipient.email.is_some() {
            channels.push(Channel::Email);
        }
        if recipient.role == Role::Admin {
            channels.push(Channel::Chat);
        }
        channels.dedup();
        channels
    }

    async fn persist_log(
        &self,
        recipient: &Recipient,
        message: &Message,
        severity: Severity,
        results: &[(Channel, ChannelOutcome)],
        successful: bool,
    ) {
        let channel_results: serde_json::Value = results
            .iter()
            .map(|(channel, outcome)| {
                let rendered = match outcome {
                    ChannelOutcome::Delivered => "ok".to_string(),
                    ChannelOutcome::Skipped => "skipped".to_string(),
                    ChannelOutcome::Failed(err) => format!("error: {err}"),
                };
                (channel.as_str().to_string(), serde_json::Value::from(rendered))
            })
            .collect::<serde_json::Map<_, _>>()
            .into();

        let record = NotificationLogRecord {
            recipient_id: recipient.id.clone(),
            role: recipient.role.as_str().to_string(),
            title: message.title.clone(),
            body_prefix: message.body.chars().take(BODY_PREFIX_MAX).collect(),
            severity: severity.as_str().to_string(),
            channel_results,
            at: Utc::now(),
            successful,
        };

        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(err) = self.sink.append(AuditTopic::NotificationLogs, value).await {
                    warn!(error = %err, "failed to persist notification log");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize notification log"),
        }
        debug!(recipient = %recipient.id, successful, "notification fan-out complete");
    }
}
