// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Walks the ordered stage list for one input buffer.
//!
//! Stages are ordered by output resolution, largest first. Each stage hands
//! its working buffer to the next one, so a smaller output is scaled from
//! the previous stage's already reduced frame instead of the original.

use crate::accel::Converter;
use crate::buffer::{Buffer, CropRect};
use crate::bus::{Domain, Poster};
use crate::format::VideoInfo;
use crate::pad::Pad;

use super::stage::{EventCache, Stage};

/// Outcome of one pass over the stage list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChainReport {
    pub(crate) produced: usize,
    pub(crate) failed: usize,
}

/// Runs every configured stage on `input`.
///
/// `input_is_free` tells the first stage whether it may pass `input` through
/// untouched. Further stages receive `true` only when the previous stage's
/// pad got a converted copy, leaving the working buffer to them alone. A
/// failing stage produces nothing for this input; the following stages
/// continue from the last good buffer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    stages: &mut [Stage],
    cache: &EventCache,
    converter: &dyn Converter,
    input: &Buffer,
    info: &VideoInfo,
    crop: CropRect,
    input_is_free: bool,
    poster: &Poster,
) -> ChainReport {
    let mut report = ChainReport::default();
    let mut current = input.clone();
    let mut current_info = *info;
    let mut crop = crop;
    let mut is_free = input_is_free;

    for stage in stages.iter_mut() {
        if stage.output_info().is_none() {
            continue;
        }
        match stage.process(converter, &current, &current_info, crop, is_free) {
            Ok(out) => {
                tracing::trace!(
                    pad = stage.pad().name(),
                    zero_copy = out.output.ptr_eq(&current),
                    converted = out.converted,
                    "Stage processed buffer"
                );
                stage.push(out.output, cache);
                crop = CropRect::full(out.working_info.width, out.working_info.height);
                current = out.working;
                current_info = out.working_info;
                is_free = out.converted;
                report.produced += 1;
            }
            Err(err) => {
                poster.warning(
                    Domain::Resource,
                    format!("Stage {} skipped a buffer: {err}", stage.pad().name()),
                );
                is_free = false;
                report.failed += 1;
            }
        }
    }
    report
}
