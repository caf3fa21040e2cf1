// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests of the batch element.
//!
//! Every test links the source pad to a collecting peer, drives the sink
//! pads from the test thread and observes what the aggregation and delivery
//! workers produce.
//!
//! # Test Coverage
//!
//! - One composite per round when every pad delivers
//! - Partial composites once the output deadline passes
//! - Evenly spaced, increasing output timestamps
//! - Input buffers pinned by the composites that consumed them
//! - Negotiation failures reported on the bus
//! - EOS forwarded after every pad drained

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CollectingDownstream, Received, next_buffer, next_item, setup_logging, wait_for_message};
use padflow::{
    Batch, BatchSettings, Bus, Caps, CapsStructure, Domain, Event, FlowError, Fraction,
    Pad, PixelFormat, Query, QueryAnswer, Severity, SinkPad, StateChange,
};
use tracing::info;

fn video_caps(rate: Option<i32>) -> Caps {
    let structure = CapsStructure::video()
        .with_format(PixelFormat::Nv12)
        .with_size(320, 240);
    Caps::from_structure(match rate {
        Some(rate) => structure.with_framerate(Fraction::new(rate, 1)),
        None => structure,
    })
}

/// Element with `pads` sink pads carrying `caps`, linked and started.
fn setup_batch(
    pads: usize,
    settings: BatchSettings,
    caps: Caps,
    peer_caps: Option<Caps>,
) -> (
    Batch,
    Vec<Arc<SinkPad>>,
    Arc<Bus>,
    crossbeam_channel::Receiver<Received>,
) {
    setup_logging();
    let bus = Arc::new(Bus::new());
    let batch = Batch::new("batch0", settings, bus.clone());
    let sink_pads: Vec<_> = (0..pads)
        .map(|_| batch.request_pad(None).unwrap())
        .collect();
    for pad in &sink_pads {
        assert!(batch.sink_event(pad, Event::Caps(caps.clone())));
    }
    let (peer, rx) = CollectingDownstream::with_caps(peer_caps);
    batch.src_pad().link(peer);
    batch.change_state(StateChange::ReadyToPaused).unwrap();
    (batch, sink_pads, bus, rx)
}

fn slow_settings() -> BatchSettings {
    BatchSettings {
        default_duration_ns: 1_000_000_000,
        ..BatchSettings::default()
    }
}

fn push(batch: &Batch, pad: &SinkPad, fill: u8) {
    let buffer = batch.arena().from_vec(vec![fill; 64]);
    batch.chain(pad, buffer).unwrap();
}

#[test]
fn all_pads_contribute_to_one_composite() {
    let (batch, pads, _bus, rx) = setup_batch(3, slow_settings(), Caps::new_any(), None);
    for (i, pad) in pads.iter().enumerate() {
        push(&batch, pad, i as u8);
    }

    let composite = next_buffer(&rx);
    assert_eq!(composite.n_memory(), 3);
    let mask = composite.channel_mask().unwrap();
    assert_eq!(mask.count(), 3);
    assert!((0..3).all(|bit| mask.contains(bit)));
    // Memory keeps the pad order.
    for i in 0..3 {
        assert_eq!(composite.memory(i).unwrap()[0], i as u8);
    }
    assert_eq!(composite.pts(), Some(Duration::ZERO));
    assert_eq!(composite.duration(), Some(Duration::from_secs(1)));
}

#[test]
fn deadline_sends_partial_composite() {
    let settings = BatchSettings {
        default_duration_ns: 50_000_000,
        ..BatchSettings::default()
    };
    let (batch, pads, _bus, rx) = setup_batch(2, settings, Caps::new_any(), None);
    push(&batch, &pads[0], 7);

    let composite = next_buffer(&rx);
    let mask = composite.channel_mask().unwrap();
    info!("Partial composite mask {mask}");
    assert_eq!(composite.n_memory(), 1);
    assert!(mask.contains(0));
    assert!(!mask.contains(1));
    assert_eq!(pads[1].queued(), 0);
}

#[test]
fn timestamps_increase_by_output_duration() {
    let (batch, pads, _bus, rx) = setup_batch(2, slow_settings(), Caps::new_any(), None);
    for round in 0..4u8 {
        for pad in &pads {
            push(&batch, pad, round);
        }
    }

    let mut previous = None;
    for round in 0..4u32 {
        let composite = next_buffer(&rx);
        let pts = composite.pts().unwrap();
        assert_eq!(pts, Duration::from_secs(1) * round);
        assert_eq!(composite.n_memory(), 2);
        if let Some(previous) = previous {
            assert!(pts > previous);
        }
        previous = Some(pts);
    }
    assert_eq!(batch.src_pad().position(), Duration::from_secs(4));
    assert_eq!(
        batch.src_query(&Query::Position),
        Some(QueryAnswer::Position(Some(Duration::from_secs(4))))
    );
}

#[test]
fn inputs_live_until_composite_is_dropped() {
    let (batch, pads, _bus, rx) = setup_batch(2, slow_settings(), Caps::new_any(), None);
    let mut ids = Vec::new();
    for pad in &pads {
        let buffer = batch.arena().from_vec(vec![1; 16]);
        ids.push(buffer.id());
        batch.chain(pad, buffer).unwrap();
    }

    let composite = next_buffer(&rx);
    assert_eq!(composite.parents(), ids);
    for id in &ids {
        assert!(batch.arena().contains(*id));
    }

    drop(composite);
    for id in &ids {
        assert!(!batch.arena().contains(*id));
    }
    assert_eq!(batch.arena().live_count(), 0);
}

#[test]
fn output_runs_at_highest_input_rate() {
    setup_logging();
    let bus = Arc::new(Bus::new());
    let batch = Batch::new("batch0", BatchSettings::default(), bus);
    let a = batch.request_pad(None).unwrap();
    let b = batch.request_pad(None).unwrap();
    batch.sink_event(&a, Event::Caps(video_caps(Some(10))));
    batch.sink_event(&b, Event::Caps(video_caps(Some(5))));
    let (peer, rx) = CollectingDownstream::new();
    batch.src_pad().link(peer);
    batch.change_state(StateChange::ReadyToPaused).unwrap();

    for _ in 0..2 {
        push(&batch, &a, 1);
        push(&batch, &b, 2);
    }
    let first = next_buffer(&rx);
    let second = next_buffer(&rx);

    let frame = Duration::from_millis(100);
    assert_eq!(batch.output_duration(), frame);
    assert_eq!(first.pts(), Some(Duration::ZERO));
    assert_eq!(second.pts(), Some(frame));
    assert_eq!(second.duration(), Some(frame));
    assert_eq!(batch.output_caps(), Some(video_caps(Some(10))));
}

#[test]
fn shorter_stream_drops_out_of_the_mask() {
    let (batch, pads, _bus, rx) = setup_batch(2, BatchSettings::default(), video_caps(Some(30)), None);
    let (a, b) = (&pads[0], &pads[1]);
    for i in 0..10 {
        push(&batch, a, 1);
        if i < 5 {
            push(&batch, b, 2);
        }
    }
    batch.sink_event(b, Event::Eos);

    let frame = Fraction::new(30, 1).frame_duration().unwrap();
    for i in 0..10u32 {
        let composite = next_buffer(&rx);
        let expected = if i < 5 { 0b11 } else { 0b01 };
        assert_eq!(composite.channel_mask().unwrap().bits(), expected, "composite {i}");
        assert_eq!(composite.n_memory(), expected.count_ones() as usize);
        assert_eq!(composite.pts(), Some(frame * i));
    }
}

#[test]
fn negotiation_failure_is_posted() {
    let peer_caps = Caps::video_formats(&[PixelFormat::Rgb]);
    let (batch, pads, bus, _rx) =
        setup_batch(2, BatchSettings::default(), video_caps(None), Some(peer_caps));

    let message = wait_for_message(&bus, Severity::Error, Domain::Negotiation);
    assert_eq!(message.source, "batch0");
    let buffer = batch.arena().from_vec(vec![0; 8]);
    assert_eq!(batch.chain(&pads[0], buffer), Err(FlowError::NotNegotiated));
}

#[test]
fn eos_follows_the_last_composite() {
    let (batch, pads, _bus, rx) = setup_batch(2, slow_settings(), Caps::new_any(), None);
    for pad in &pads {
        push(&batch, pad, 3);
    }
    for pad in &pads {
        batch.sink_event(pad, Event::Eos);
    }

    assert!(matches!(
        next_item(&rx),
        Received::Event(Event::StreamStart { ref stream_id }) if stream_id.starts_with("batch-")
    ));
    assert!(matches!(next_item(&rx), Received::Event(Event::Caps(Caps::Any))));
    assert!(matches!(next_item(&rx), Received::Event(Event::Segment(_))));
    match next_item(&rx) {
        Received::Buffer(composite) => assert_eq!(composite.n_memory(), 2),
        other => panic!("Expected a composite, got {other:?}"),
    }
    assert!(matches!(next_item(&rx), Received::Event(Event::Eos)));
    assert!(batch.src_pad().flags().eos);
}

#[test]
fn released_pad_shifts_mask_positions() {
    let (batch, pads, _bus, rx) = setup_batch(3, slow_settings(), Caps::new_any(), None);
    batch.release_pad(&pads[1]).unwrap();
    push(&batch, &pads[0], 0);
    push(&batch, &pads[2], 2);

    let composite = next_buffer(&rx);
    assert_eq!(composite.channel_mask().unwrap().bits(), 0b11);
    assert_eq!(composite.memory(1).unwrap()[0], 2);
    assert_eq!(batch.chain(&pads[1], batch.arena().allocate_empty()), Err(FlowError::Flushing));
}
