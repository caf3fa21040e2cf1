// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Control events, queries and state transitions exchanged with the host.

use std::time::Duration;

use crate::format::Caps;

/// Time-format segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Playback rate.
    pub rate: f64,
    /// Start of the segment in stream time.
    pub start: Duration,
    /// End of the segment, `None` for open-ended segments.
    pub stop: Option<Duration>,
    /// Current position inside the segment.
    pub position: Duration,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            position: Duration::ZERO,
        }
    }
}

/// Events travelling along pads.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Start of a logical stream.
    StreamStart {
        /// Identifier of the stream.
        stream_id: String,
    },
    /// Format declaration.
    Caps(Caps),
    /// Timeline declaration.
    Segment(Segment),
    /// Start of a flush; buffers are dropped until [`Event::FlushStop`].
    FlushStart,
    /// End of a flush.
    FlushStop {
        /// Whether running time restarts at zero.
        reset_time: bool,
    },
    /// End of stream.
    Eos,
}

impl Event {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StreamStart { .. } => "stream-start",
            Event::Caps(_) => "caps",
            Event::Segment(_) => "segment",
            Event::FlushStart => "flush-start",
            Event::FlushStop { .. } => "flush-stop",
            Event::Eos => "eos",
        }
    }

    /// Events that must stay ordered with buffers.
    pub fn is_serialized(&self) -> bool {
        !matches!(self, Event::FlushStart)
    }
}

/// Queries handled by the elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Which caps can the pad handle, optionally restricted by `filter`.
    Caps(Option<Caps>),
    /// Would the pad accept these caps.
    AcceptCaps(Caps),
    /// Current stream position.
    Position,
    /// Latency introduced by the element.
    Latency,
}

/// Answers to [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAnswer {
    /// Answer to [`Query::Caps`].
    Caps(Caps),
    /// Answer to [`Query::AcceptCaps`].
    AcceptCaps(bool),
    /// Answer to [`Query::Position`].
    Position(Option<Duration>),
    /// Answer to [`Query::Latency`].
    Latency {
        /// Whether the element is live.
        live: bool,
        /// Minimum latency.
        min: Duration,
        /// Maximum latency, `None` for unbounded.
        max: Option<Duration>,
    },
}

/// Element state transitions the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// Allocate resources and start worker threads.
    ReadyToPaused,
    /// Start streaming; no-op for the engine.
    PausedToPlaying,
    /// Pause streaming; no-op for the engine.
    PlayingToPaused,
    /// Stop worker threads, flush queues and reset.
    PausedToReady,
}
