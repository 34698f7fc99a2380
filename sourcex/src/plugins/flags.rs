use std::sync::Arc;

use crate::entity::{Entity, Source};
use crate::error::Result;
use crate::plugins::detection::DetectionFrame;
use crate::plugins::measurement_frame::MeasurementFrameRectangle;
use crate::plugins::pixel::{PeakValue, PixelBoundaries};
use crate::property::{Property, PropertyId, PropertyKind};
use crate::task::{source_task, Task, TaskFactory};

/// Peak pixel reached the detector saturation level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaturateFlag(pub bool);

impl Property for SaturateFlag {
    const NAME: &'static str = "SaturateFlag";
}

/// Source touches the edge of the detection image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryFlag(pub bool);

impl Property for BoundaryFlag {
    const NAME: &'static str = "BoundaryFlag";
}

/// Combined catalog flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceFlags {
    pub bits: u64,
}

impl SourceFlags {
    pub const SATURATED: u64 = 1;
    pub const BOUNDARY: u64 = 2;
    pub const BAD_PROJECTION: u64 = 4;

    pub fn contains(&self, flag: u64) -> bool {
        self.bits & flag == flag
    }
}

impl Property for SourceFlags {
    const NAME: &'static str = "SourceFlags";
}

/// Produces the flag properties. `measurement_frames` instances of
/// [`MeasurementFrameRectangle`] are consulted for bad projections.
#[derive(Debug, Default)]
pub struct FlagsTaskFactory {
    measurement_frames: u32,
}

impl FlagsTaskFactory {
    pub fn new(measurement_frames: u32) -> Self {
        Self { measurement_frames }
    }
}

impl TaskFactory for FlagsTaskFactory {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn produced_properties(&self) -> Vec<PropertyKind> {
        vec![
            PropertyKind::of::<SaturateFlag>(),
            PropertyKind::of::<BoundaryFlag>(),
            PropertyKind::of::<SourceFlags>(),
        ]
    }

    fn create_source_task(&self, id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        if id.instance != 0 {
            return None;
        }
        let kind = id.kind;
        if kind == PropertyKind::of::<SaturateFlag>() {
            Some(source_task(|source: &mut Source| {
                let frame = source.get_property::<DetectionFrame>()?;
                let peak = source.get_property::<PeakValue>()?;
                let frame = &frame.frame;
                let saturated = frame.is_saturated(peak.value + frame.background);
                source.set_property(SaturateFlag(saturated));
                Ok(())
            }))
        } else if kind == PropertyKind::of::<BoundaryFlag>() {
            Some(source_task(|source: &mut Source| {
                let frame = source.get_property::<DetectionFrame>()?;
                let bounds = source.get_property::<PixelBoundaries>()?;
                let (width, height) = (frame.frame.width() as i64, frame.frame.height() as i64);
                let touches = bounds.min_x <= 0
                    || bounds.min_y <= 0
                    || bounds.max_x >= width - 1
                    || bounds.max_y >= height - 1;
                source.set_property(BoundaryFlag(touches));
                Ok(())
            }))
        } else if kind == PropertyKind::of::<SourceFlags>() {
            let frames = self.measurement_frames;
            Some(source_task(move |source: &mut Source| {
                let mut bits = 0;
                if source.get_property::<SaturateFlag>()?.0 {
                    bits |= SourceFlags::SATURATED;
                }
                if source.get_property::<BoundaryFlag>()?.0 {
                    bits |= SourceFlags::BOUNDARY;
                }
                for instance in 0..frames {
                    let rect = source.get_indexed_property::<MeasurementFrameRectangle>(instance)?;
                    if rect.bad_projection {
                        bits |= SourceFlags::BAD_PROJECTION;
                    }
                }
                source.set_property(SourceFlags { bits });
                Ok(())
            }))
        } else {
            None
        }
    }
}
