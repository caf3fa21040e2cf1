// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for padflow operations.
//!
//! Two families of errors exist side by side:
//!
//! - [`Error`]: control-path failures (pad requests, negotiation, pool and
//!   accelerator failures, configuration). Returned as [`Result`].
//! - [`FlowError`]: data-path returns from `chain` and downstream pushes,
//!   mirroring the flow returns of the host pipeline framework.

use crate::format::PixelFormat;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while driving padflow elements.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested pad name does not follow the pad template.
    #[error("Pad name {name:?} does not match template {template:?}")]
    InvalidPadName {
        /// Name that was requested.
        name: String,
        /// Template the name was checked against (e.g. `sink_%u`).
        template: &'static str,
    },

    /// An explicitly named pad index is already taken by a live pad.
    #[error("Pad index {0} is already in use")]
    PadIndexInUse(u32),

    /// The pad is not (or no longer) attached to this element.
    #[error("Unknown pad {0}")]
    UnknownPad(String),

    /// No common format could be found, or a format was rejected.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A buffer pool had no free buffer and may not grow.
    #[error("Buffer pool exhausted ({max} buffers in use)")]
    PoolExhausted {
        /// Configured maximum number of outstanding buffers.
        max: usize,
    },

    /// A buffer was requested from a pool that is not active.
    #[error("Buffer pool is not active")]
    PoolInactive,

    /// The accelerator back end reported a failure.
    #[error("Accelerator failure: {0}")]
    Accelerator(String),

    /// The converter cannot produce the requested output format.
    #[error("Unsupported conversion from {from} to {to}")]
    UnsupportedConversion {
        /// Source pixel format.
        from: PixelFormat,
        /// Requested destination pixel format.
        to: PixelFormat,
    },

    /// A mapped frame is smaller than its format requires.
    #[error("Frame too small: expected {expected} bytes, got {actual}")]
    FrameSize {
        /// Bytes required by the frame's [`crate::VideoInfo`].
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Buffer metadata is inconsistent with the element configuration.
    #[error("Malformed metadata: {0}")]
    MalformedMeta(String),

    /// A configuration document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),

    /// A generic error for failures not covered above.
    #[error("Other error: {0}")]
    Other(String),
}

/// Data-flow errors returned by `chain` entry points and downstream pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The pad is flushing; the buffer was dropped.
    #[error("flushing")]
    Flushing,

    /// The pad already received end-of-stream.
    #[error("end of stream")]
    Eos,

    /// The source pad has no downstream peer.
    #[error("not linked")]
    NotLinked,

    /// Data arrived before a format was agreed on.
    #[error("not negotiated")]
    NotNegotiated,

    /// A fatal processing error.
    #[error("error")]
    Error,
}

/// Result type of data-flow operations.
pub type FlowResult = core::result::Result<(), FlowError>;
