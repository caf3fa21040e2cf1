// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! One processing stage, bound to one `video_%u` output pad.

use std::sync::Arc;

use crate::accel::{ConvertOptions, Converter, VideoFrame, VideoFrameMut};
use crate::buffer::{Buffer, CropRect, Memory};
use crate::config::CropSettings;
use crate::error::{Error, Result};
use crate::event::{Event, Segment};
use crate::format::{Caps, CapsStructure, PixelFormat, VideoInfo};
use crate::pad::{Pad, SrcPad};

use super::pool::FramePool;

/// Sticky input events, replayed lazily on every output pad.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventCache {
    pub(crate) stream_id: Option<String>,
    pub(crate) segment: Option<Segment>,
}

#[derive(Debug, Default)]
struct PendingEvents {
    stream_start: bool,
    caps: bool,
    segment: bool,
}

/// What a stage produced for one input.
pub(crate) struct StageOutput {
    /// Buffer pushed on the stage's own pad.
    pub(crate) output: Buffer,
    /// Buffer handed to the next stage.
    pub(crate) working: Buffer,
    /// Format of `working`.
    pub(crate) working_info: VideoInfo,
    /// Whether a colour conversion produced `output`, leaving `working`
    /// unreferenced by this stage's pad.
    pub(crate) converted: bool,
}

pub(crate) struct Stage {
    pad: Arc<SrcPad>,
    output: Option<VideoInfo>,
    scale_pool: Option<FramePool>,
    convert_pool: Option<FramePool>,
    pending: PendingEvents,
}

impl Stage {
    pub(crate) fn new(pad: Arc<SrcPad>) -> Self {
        Stage {
            pad,
            output: None,
            scale_pool: None,
            convert_pool: None,
            pending: PendingEvents {
                stream_start: true,
                caps: false,
                segment: true,
            },
        }
    }

    pub(crate) fn pad(&self) -> &Arc<SrcPad> {
        &self.pad
    }

    pub(crate) fn output_info(&self) -> Option<VideoInfo> {
        self.output
    }

    /// Output area, 0 while unconfigured.
    pub(crate) fn area(&self) -> u64 {
        self.output.map(|info| info.area()).unwrap_or(0)
    }

    /// Fixes the output format against the downstream peer and allocates
    /// the stage's pools.
    pub(crate) fn configure(
        &mut self,
        input: &VideoInfo,
        converter: &dyn Converter,
        settings: &CropSettings,
        active: bool,
    ) -> Result<VideoInfo> {
        let peer = self.pad.peer_query_caps(None);
        let output = fixate(input, peer, converter)?;

        let scale_info = VideoInfo {
            format: input.format,
            width: output.width,
            height: output.height,
            framerate: input.framerate,
        };
        let scale_pool = FramePool::new(
            scale_info.size(),
            settings.pool_min_buffers,
            settings.pool_max_buffers,
        );
        let convert_pool = (output.format != input.format).then(|| {
            FramePool::new(
                output.size(),
                settings.pool_min_buffers,
                settings.pool_max_buffers,
            )
        });

        self.set_pools_active(false);
        self.scale_pool = Some(scale_pool);
        self.convert_pool = convert_pool;
        if active {
            self.set_pools_active(true);
        }
        self.output = Some(output);
        self.pending.caps = true;

        tracing::debug!(
            pad = self.pad.name(),
            output = %output.to_structure(),
            convert = self.convert_pool.is_some(),
            "Configured stage"
        );
        Ok(output)
    }

    pub(crate) fn set_pools_active(&self, active: bool) {
        for pool in self.scale_pool.iter().chain(self.convert_pool.iter()) {
            pool.set_active(active);
        }
    }

    /// Frees the pools and forgets the output format.
    pub(crate) fn reset(&mut self) {
        self.set_pools_active(false);
        self.scale_pool = None;
        self.convert_pool = None;
        self.output = None;
        self.pending = PendingEvents {
            stream_start: true,
            caps: false,
            segment: true,
        };
    }

    pub(crate) fn mark_stream_start(&mut self) {
        self.pending.stream_start = true;
    }

    pub(crate) fn mark_segment(&mut self) {
        self.pending.segment = true;
    }

    /// Runs the stage on `input`, whose region `crop` is selected.
    ///
    /// Without scaling or conversion the input buffer itself is the output.
    /// Scaling happens whenever the crop is not the full frame, the crop size
    /// differs from the output size, or the caller does not own `input`
    /// exclusively (`input_is_free == false`).
    pub(crate) fn process(
        &self,
        converter: &dyn Converter,
        input: &Buffer,
        input_info: &VideoInfo,
        crop: CropRect,
        input_is_free: bool,
    ) -> Result<StageOutput> {
        let output = self
            .output
            .ok_or_else(|| Error::Negotiation(format!("{} is not configured", self.pad.name())))?;
        let rect = crop
            .clamp_to(input_info.width, input_info.height)
            .ok_or_else(|| Error::MalformedMeta(format!("crop {crop:?} lies outside the frame")))?;

        let needs_scale = !input_is_free
            || !rect.is_full(input_info.width, input_info.height)
            || rect.width != output.width
            || rect.height != output.height;

        let (working, working_info) = if needs_scale {
            let info = VideoInfo {
                format: input_info.format,
                width: output.width,
                height: output.height,
                framerate: input_info.framerate,
            };
            let pool = self.scale_pool.as_ref().ok_or(Error::PoolInactive)?;
            let memory = convert_into(converter, pool, input, input_info, &info, Some(rect))?;
            let scaled = input.arena().allocate(vec![memory]);
            scaled.copy_metadata_from(input);
            (scaled, info)
        } else {
            (input.clone(), *input_info)
        };

        if working_info.format == output.format {
            return Ok(StageOutput {
                output: working.clone(),
                working,
                working_info,
                converted: false,
            });
        }

        let pool = self.convert_pool.as_ref().ok_or(Error::PoolInactive)?;
        let memory = convert_into(converter, pool, &working, &working_info, &output, None)?;
        let converted = input.arena().allocate(vec![memory]);
        converted.copy_metadata_from(input);
        Ok(StageOutput {
            output: converted,
            working,
            working_info,
            converted: true,
        })
    }

    /// Emits the sticky events this pad has not seen yet.
    pub(crate) fn emit_pending(&mut self, cache: &EventCache) {
        if std::mem::take(&mut self.pending.stream_start) {
            let upstream = cache.stream_id.as_deref().unwrap_or("videocrop");
            self.pad.enqueue_event(Event::StreamStart {
                stream_id: format!("{upstream}/{}", self.pad.name()),
            });
        }
        if std::mem::take(&mut self.pending.caps) {
            if let Some(output) = self.output {
                self.pad.enqueue_event(Event::Caps(output.to_caps()));
            }
        }
        if std::mem::take(&mut self.pending.segment) {
            self.pad
                .enqueue_event(Event::Segment(cache.segment.unwrap_or_default()));
        }
    }

    /// Queues this stage's output on its pad.
    pub(crate) fn push(&mut self, buffer: Buffer, cache: &EventCache) -> bool {
        self.emit_pending(cache);
        self.pad.enqueue_buffer(buffer)
    }
}

fn convert_into(
    converter: &dyn Converter,
    pool: &FramePool,
    src: &Buffer,
    src_info: &VideoInfo,
    dst_info: &VideoInfo,
    crop: Option<CropRect>,
) -> Result<Memory> {
    let mut frame = pool.acquire()?;
    let data = src.contiguous();
    {
        let input = VideoFrame::new(*src_info, &data)?;
        let mut output = VideoFrameMut::new(*dst_info, frame.as_mut_slice())?;
        converter.convert(&input, &mut output, &ConvertOptions { crop })?;
    }
    Ok(frame.into_memory())
}

/// Picks the output format of a stage. Unconstrained fields follow the
/// input, and the input's own format is preferred when allowed.
pub(crate) fn fixate(
    input: &VideoInfo,
    peer: Option<Caps>,
    converter: &dyn Converter,
) -> Result<VideoInfo> {
    let producible = Caps::List(
        PixelFormat::ALL
            .into_iter()
            .filter(|format| converter.can_convert(input.format, *format))
            .map(|format| CapsStructure::video().with_format(format))
            .collect(),
    );
    let candidates = match peer {
        Some(peer) => peer.intersect(&producible),
        None => producible,
    };
    let chosen = candidates
        .structures()
        .iter()
        .find(|s| s.format == Some(input.format))
        .or_else(|| candidates.structures().first())
        .ok_or_else(|| {
            Error::Negotiation(format!(
                "{} cannot produce any format downstream accepts from {}",
                converter.name(),
                input.format
            ))
        })?;

    Ok(VideoInfo {
        format: chosen.format.unwrap_or(input.format),
        width: chosen.width.filter(|w| *w > 0).unwrap_or(input.width),
        height: chosen.height.filter(|h| *h > 0).unwrap_or(input.height),
        framerate: chosen.framerate.or(input.framerate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SoftwareConverter;

    #[test]
    fn fixation_prefers_input_format_and_size() {
        let input = VideoInfo::new(PixelFormat::Nv12, 1920, 1080);
        let output = fixate(&input, None, &SoftwareConverter).unwrap();
        assert_eq!(output, input);

        let peer = Caps::from_structure(
            CapsStructure::video()
                .with_format(PixelFormat::Rgb)
                .with_size(640, 360),
        );
        let output = fixate(&input, Some(peer), &SoftwareConverter).unwrap();
        assert_eq!(output, VideoInfo::new(PixelFormat::Rgb, 640, 360));
    }

    #[test]
    fn fixation_fails_without_producible_format() {
        let input = VideoInfo::new(PixelFormat::Rgba, 64, 64);
        let peer = Caps::video_formats(&[PixelFormat::Nv12]);
        assert!(matches!(
            fixate(&input, Some(peer), &SoftwareConverter),
            Err(Error::Negotiation(_))
        ));
    }
}
