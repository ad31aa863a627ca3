//! Outbound notifications.
//!
//! Delivery is fire-and-forget: the engine logs a failed notification and
//! moves on. State is never rolled back because an email bounced.

use crate::envelope::{Envelope, EnvelopeId, SignerId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// A signer's personal signing link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningLink {
    pub signer_id: SignerId,
    pub name: String,
    pub email: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    EnvelopeActivated {
        envelope_id: EnvelopeId,
        links: Vec<SigningLink>,
    },
    SignerCompleted {
        envelope_id: EnvelopeId,
        signer_id: SignerId,
    },
    EnvelopeCompleted {
        envelope_id: EnvelopeId,
        artifact_hash: String,
    },
    EnvelopeDeclined {
        envelope_id: EnvelopeId,
        signer_id: SignerId,
        reason: String,
    },
    EnvelopeVoided {
        envelope_id: EnvelopeId,
        actor: String,
    },
}

impl Event {
    /// Activation event carrying every signer's link.
    pub fn activated(envelope: &Envelope) -> Self {
        Event::EnvelopeActivated {
            envelope_id: envelope.id,
            links: envelope
                .signers
                .iter()
                .map(|s| SigningLink {
                    signer_id: s.id,
                    name: s.identity.name.clone(),
                    email: s.identity.email.clone(),
                    token: s.access_token.clone(),
                })
                .collect(),
        }
    }

    pub fn envelope_id(&self) -> EnvelopeId {
        match self {
            Event::EnvelopeActivated { envelope_id, .. }
            | Event::SignerCompleted { envelope_id, .. }
            | Event::EnvelopeCompleted { envelope_id, .. }
            | Event::EnvelopeDeclined { envelope_id, .. }
            | Event::EnvelopeVoided { envelope_id, .. } => *envelope_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::EnvelopeActivated { .. } => "envelope_activated",
            Event::SignerCompleted { .. } => "signer_completed",
            Event::EnvelopeCompleted { .. } => "envelope_completed",
            Event::EnvelopeDeclined { .. } => "envelope_declined",
            Event::EnvelopeVoided { .. } => "envelope_voided",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Sink for envelope events (email, webhooks, queues).
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        match event {
            Event::EnvelopeActivated { envelope_id, links } => {
                for link in links {
                    log::info!(
                        "Envelope {} ready for {} <{}>, token {}",
                        envelope_id,
                        link.name,
                        link.email,
                        link.token
                    );
                }
            }
            other => log::info!("Envelope {}: {}", other.envelope_id(), other.name()),
        }
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        self.events
            .lock()
            .map_err(|e| NotifyError::Delivery(format!("Lock error: {}", e)))?
            .push(event.clone());
        Ok(())
    }
}
