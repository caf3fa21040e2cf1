// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use padflow::{
    Buffer, Bus, Caps, ConvertOptions, Converter, Domain, Downstream, Error, Event, FlowResult,
    Message, PixelFormat, Severity, VideoFrame, VideoFrameMut,
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// How long a test waits for an item before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_logging() {
    // Initialize logging once (respects RUST_LOG environment variable)
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

/// Something a [`CollectingDownstream`] received.
#[derive(Debug)]
pub enum Received {
    Buffer(Buffer),
    Event(Event),
}

/// Downstream peer forwarding everything it receives into a channel.
pub struct CollectingDownstream {
    tx: Sender<Received>,
    caps: Option<Caps>,
}

impl CollectingDownstream {
    /// Creates a peer that does not constrain caps.
    pub fn new() -> (Arc<Self>, Receiver<Received>) {
        Self::with_caps(None)
    }

    /// Creates a peer answering caps queries with `caps`.
    pub fn with_caps(caps: Option<Caps>) -> (Arc<Self>, Receiver<Received>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx, caps }), rx)
    }
}

impl Downstream for CollectingDownstream {
    fn push(&self, buffer: Buffer) -> FlowResult {
        // The receiver may already be gone when a test ends early.
        let _ = self.tx.send(Received::Buffer(buffer));
        Ok(())
    }

    fn push_event(&self, event: Event) -> bool {
        let _ = self.tx.send(Received::Event(event));
        true
    }

    fn query_caps(&self, filter: Option<&Caps>) -> Option<Caps> {
        let caps = self.caps.clone()?;
        Some(match filter {
            Some(filter) => filter.intersect(&caps),
            None => caps,
        })
    }
}

/// Converter whose device fails on every frame. Only same-format output is
/// advertised, so stages still negotiate.
pub struct FailingConverter;

impl Converter for FailingConverter {
    fn name(&self) -> &str {
        "failing"
    }

    fn can_convert(&self, from: PixelFormat, to: PixelFormat) -> bool {
        from == to
    }

    fn convert(
        &self,
        _input: &VideoFrame<'_>,
        _output: &mut VideoFrameMut<'_>,
        _options: &ConvertOptions,
    ) -> padflow::Result<()> {
        Err(Error::Accelerator("device lost".to_owned()))
    }
}

/// Waits for the next buffer, skipping events.
pub fn next_buffer(rx: &Receiver<Received>) -> Buffer {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        match rx.recv_deadline(deadline) {
            Ok(Received::Buffer(buffer)) => return buffer,
            Ok(Received::Event(_)) => continue,
            Err(err) => panic!("No buffer received: {err}"),
        }
    }
}

/// Waits for the next item.
pub fn next_item(rx: &Receiver<Received>) -> Received {
    rx.recv_timeout(RECV_TIMEOUT)
        .unwrap_or_else(|err| panic!("Nothing received: {err}"))
}

/// Polls `bus` until a message of `severity` in `domain` shows up.
pub fn wait_for_message(bus: &Bus, severity: Severity, domain: Domain) -> Message {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        if let Some(message) = bus
            .with_severity(severity)
            .into_iter()
            .find(|m| m.domain == domain)
        {
            return message;
        }
        assert!(
            Instant::now() < deadline,
            "No {severity:?} message in {domain:?} posted"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}
