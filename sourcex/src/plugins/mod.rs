//! Reference task factories and the catalog columns built on them.

pub mod detection;
pub mod flags;
pub mod group;
pub mod measurement_frame;
pub mod pixel;

use std::sync::Arc;

use crate::error::Result;
use crate::frame::Frame;
use crate::output::{ColumnValue, OutputColumn, OutputRegistry};
use crate::task::TaskFactoryRegistry;

use detection::{DetectionId, PixelCoordinateList, SourceId};
use flags::{FlagsTaskFactory, SourceFlags};
use group::{GroupBoundaries, GroupInfo, GroupTaskFactory};
use measurement_frame::{MeasurementFrameRectangle, MeasurementFrameTaskFactory};
use pixel::{IsophotalFlux, PeakValue, PixelBoundaries, PixelCentroid, PixelTaskFactory};

/// Registers every reference factory. Measurement frame `i` becomes
/// instance `i` of the per-frame properties.
pub fn register_default_plugins(
    registry: &mut TaskFactoryRegistry,
    measurement_frames: Vec<Arc<Frame>>,
) -> Result<()> {
    let frame_count = measurement_frames.len() as u32;
    registry.register(Box::new(PixelTaskFactory::default()))?;
    registry.register(Box::new(FlagsTaskFactory::new(frame_count)))?;
    registry.register(Box::new(GroupTaskFactory))?;
    registry.register(Box::new(MeasurementFrameTaskFactory::new(measurement_frames)))?;
    Ok(())
}

fn int(value: i64) -> ColumnValue {
    ColumnValue::Int(value)
}

/// Registers the catalog columns of the reference plugins.
pub fn register_default_columns(outputs: &mut OutputRegistry, measurement_frames: u32) -> Result<()> {
    outputs.register(OutputColumn::source::<SourceId, _>("SOURCE_ID", 0, |id| {
        int(id.0 as i64)
    }))?;
    outputs.register(OutputColumn::group::<GroupInfo, _>("GROUP_ID", |info| {
        int(info.group_id as i64)
    }))?;
    outputs.register(OutputColumn::source::<DetectionId, _>("DETECTION_ID", 0, |id| {
        int(id.0 as i64)
    }))?;
    outputs.register(OutputColumn::source::<PixelCoordinateList, _>("NPIX", 0, |pixels| {
        int(pixels.len() as i64)
    }))?;
    outputs.register(OutputColumn::source::<PixelCentroid, _>("X_IMAGE", 0, |c| {
        ColumnValue::Float(c.x)
    }))?;
    outputs.register(OutputColumn::source::<PixelCentroid, _>("Y_IMAGE", 0, |c| {
        ColumnValue::Float(c.y)
    }))?;
    outputs.register(OutputColumn::source::<PixelBoundaries, _>("XMIN_IMAGE", 0, |b| int(b.min_x)))?;
    outputs.register(OutputColumn::source::<PixelBoundaries, _>("YMIN_IMAGE", 0, |b| int(b.min_y)))?;
    outputs.register(OutputColumn::source::<PixelBoundaries, _>("XMAX_IMAGE", 0, |b| int(b.max_x)))?;
    outputs.register(OutputColumn::source::<PixelBoundaries, _>("YMAX_IMAGE", 0, |b| int(b.max_y)))?;
    outputs.register(OutputColumn::source::<IsophotalFlux, _>("FLUX_ISO", 0, |f| {
        ColumnValue::Float(f.flux)
    }))?;
    outputs.register(OutputColumn::source::<IsophotalFlux, _>("MAG_ISO", 0, |f| {
        ColumnValue::Float(f.magnitude)
    }))?;
    outputs.register(OutputColumn::source::<PeakValue, _>("FLUX_MAX", 0, |p| {
        ColumnValue::Float(p.value)
    }))?;
    outputs.register(OutputColumn::source::<SourceFlags, _>("FLAGS", 0, |f| {
        int(f.bits as i64)
    }))?;
    outputs.register(OutputColumn::group::<GroupBoundaries, _>("GROUP_XMIN", |b| int(b.0.min_x)))?;
    outputs.register(OutputColumn::group::<GroupBoundaries, _>("GROUP_YMIN", |b| int(b.0.min_y)))?;
    outputs.register(OutputColumn::group::<GroupBoundaries, _>("GROUP_XMAX", |b| int(b.0.max_x)))?;
    outputs.register(OutputColumn::group::<GroupBoundaries, _>("GROUP_YMAX", |b| int(b.0.max_y)))?;

    for frame in 0..measurement_frames {
        let suffix = frame + 1;
        outputs.register(OutputColumn::source::<MeasurementFrameRectangle, _>(
            format!("XMIN_FRAME_{}", suffix),
            frame,
            |r| int(r.min_x),
        ))?;
        outputs.register(OutputColumn::source::<MeasurementFrameRectangle, _>(
            format!("YMIN_FRAME_{}", suffix),
            frame,
            |r| int(r.min_y),
        ))?;
        outputs.register(OutputColumn::source::<MeasurementFrameRectangle, _>(
            format!("XMAX_FRAME_{}", suffix),
            frame,
            |r| int(r.max_x),
        ))?;
        outputs.register(OutputColumn::source::<MeasurementFrameRectangle, _>(
            format!("YMAX_FRAME_{}", suffix),
            frame,
            |r| int(r.max_y),
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
