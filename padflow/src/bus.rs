// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Reporting channel towards the host framework.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational.
    Info,
    /// Something unexpected that the element recovered from.
    Warning,
    /// The element cannot continue.
    Error,
}

/// Error domain of a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Format negotiation.
    Negotiation,
    /// Buffer pools, threads, accelerators.
    Resource,
    /// Data flow.
    Stream,
}

/// A message posted by an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Name of the posting element.
    pub source: String,
    /// Severity.
    pub severity: Severity,
    /// Domain.
    pub domain: Domain,
    /// Human readable text.
    pub text: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}/{:?}] {}: {}",
            self.severity, self.domain, self.source, self.text
        )
    }
}

/// Receiver of element messages, implemented by the host bridge.
pub trait MessageSink: Send + Sync {
    /// Posts one message.
    fn post(&self, message: Message);
}

/// In-process [`MessageSink`] collecting every message.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Bus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all messages posted so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Messages of the given severity.
    pub fn with_severity(&self, severity: Severity) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.severity == severity)
            .cloned()
            .collect()
    }

    /// Removes and returns all messages.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl MessageSink for Bus {
    fn post(&self, message: Message) {
        self.messages.lock().push(message);
    }
}

/// Posts messages on behalf of one element and mirrors them into the log.
#[derive(Clone)]
pub(crate) struct Poster {
    source: String,
    sink: Arc<dyn MessageSink>,
}

impl Poster {
    pub(crate) fn new(source: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        Poster {
            source: source.into(),
            sink,
        }
    }

    pub(crate) fn error(&self, domain: Domain, text: impl Into<String>) {
        let text = text.into();
        tracing::error!(element = %self.source, ?domain, "{text}");
        self.post(Severity::Error, domain, text);
    }

    pub(crate) fn warning(&self, domain: Domain, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(element = %self.source, ?domain, "{text}");
        self.post(Severity::Warning, domain, text);
    }

    fn post(&self, severity: Severity, domain: Domain, text: String) {
        self.sink.post(Message {
            source: self.source.clone(),
            severity,
            domain,
            text,
        });
    }
}
