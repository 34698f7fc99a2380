//! Properties tying a source to each measurement frame.
//!
//! Every property here is indexed by measurement frame: instance `i`
//! refers to the `i`-th frame handed to [`MeasurementFrameTaskFactory`].

use std::sync::Arc;

use crate::coordinates::{CoordinateSystem, ImageCoordinate};
use crate::entity::{Entity, Source};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::plugins::detection::DetectionFrame;
use crate::plugins::pixel::PixelBoundaries;
use crate::property::{Property, PropertyId, PropertyKind};
use crate::task::{source_task, Task, TaskFactory};

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementFrameInfo {
    pub label: String,
    pub width: usize,
    pub height: usize,
    pub background: f64,
    pub gain: f64,
}

impl Property for MeasurementFrameInfo {
    const NAME: &'static str = "MeasurementFrameInfo";
}

#[derive(Clone, Debug)]
pub struct MeasurementFrameCoordinates {
    pub coordinates: Arc<dyn CoordinateSystem>,
}

impl Property for MeasurementFrameCoordinates {
    const NAME: &'static str = "MeasurementFrameCoordinates";
}

/// Detection bounding box projected into a measurement frame and clipped
/// to it. When the box misses the frame it is the empty sentinel `-1`
/// everywhere; `bad_projection` is only set when the coordinate transform
/// itself failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeasurementFrameRectangle {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
    pub bad_projection: bool,
}

impl MeasurementFrameRectangle {
    pub const BAD: MeasurementFrameRectangle = MeasurementFrameRectangle {
        min_x: -1,
        min_y: -1,
        max_x: -1,
        max_y: -1,
        bad_projection: true,
    };

    pub const OFF_FRAME: MeasurementFrameRectangle = MeasurementFrameRectangle {
        bad_projection: false,
        ..Self::BAD
    };

    pub fn is_empty(&self) -> bool {
        self.max_x < 0
    }
}

impl Property for MeasurementFrameRectangle {
    const NAME: &'static str = "MeasurementFrameRectangle";
}

fn project(
    detection: &dyn CoordinateSystem,
    target: &dyn CoordinateSystem,
    point: ImageCoordinate,
) -> Result<ImageCoordinate> {
    let world = detection.image_to_world(point)?;
    target.world_to_image(world)
}

fn compute_rectangle(source: &mut Source, instance: u32) -> Result<()> {
    let detection = source.get_property::<DetectionFrame>()?;
    let bounds = source.get_property::<PixelBoundaries>()?;
    let info = source.get_indexed_property::<MeasurementFrameInfo>(instance)?;
    let target = source.get_indexed_property::<MeasurementFrameCoordinates>(instance)?;

    // pixel edges, not centers
    let corners = [
        (bounds.min_x as f64 - 0.5, bounds.min_y as f64 - 0.5),
        (bounds.max_x as f64 + 0.5, bounds.min_y as f64 - 0.5),
        (bounds.min_x as f64 - 0.5, bounds.max_y as f64 + 0.5),
        (bounds.max_x as f64 + 0.5, bounds.max_y as f64 + 0.5),
    ];
    let mut min = (f64::INFINITY, f64::INFINITY);
    let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (x, y) in corners {
        let projected = match project(
            detection.frame.coordinates.as_ref(),
            target.coordinates.as_ref(),
            ImageCoordinate::new(x, y),
        ) {
            Ok(projected) => projected,
            Err(Error::InvalidCoordinates(reason)) => {
                tracing::debug!(source = %source.id(), frame = instance, reason = %reason, "bad projection");
                source.set_indexed_property(instance, MeasurementFrameRectangle::BAD);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        min = (min.0.min(projected.x), min.1.min(projected.y));
        max = (max.0.max(projected.x), max.1.max(projected.y));
    }

    let (width, height) = (info.width as i64, info.height as i64);
    let rect = MeasurementFrameRectangle {
        min_x: ((min.0 + 0.5).floor() as i64).max(0),
        min_y: ((min.1 + 0.5).floor() as i64).max(0),
        max_x: ((max.0 - 0.5).ceil() as i64).min(width - 1),
        max_y: ((max.1 - 0.5).ceil() as i64).min(height - 1),
        bad_projection: false,
    };
    if rect.min_x > rect.max_x || rect.min_y > rect.max_y {
        source.set_indexed_property(instance, MeasurementFrameRectangle::OFF_FRAME);
    } else {
        source.set_indexed_property(instance, rect);
    }
    Ok(())
}

/// Produces the per-frame properties for a fixed list of measurement
/// frames.
#[derive(Debug, Default)]
pub struct MeasurementFrameTaskFactory {
    frames: Vec<Arc<Frame>>,
}

impl MeasurementFrameTaskFactory {
    pub fn new(frames: Vec<Arc<Frame>>) -> Self {
        Self { frames }
    }

    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }
}

impl TaskFactory for MeasurementFrameTaskFactory {
    fn name(&self) -> &'static str {
        "measurement_frame"
    }

    fn produced_properties(&self) -> Vec<PropertyKind> {
        vec![
            PropertyKind::of::<MeasurementFrameInfo>(),
            PropertyKind::of::<MeasurementFrameCoordinates>(),
            PropertyKind::of::<MeasurementFrameRectangle>(),
        ]
    }

    fn create_source_task(&self, id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        let instance = id.instance;
        let frame = self.frames.get(instance as usize)?.clone();
        let kind = id.kind;
        if kind == PropertyKind::of::<MeasurementFrameInfo>() {
            Some(source_task(move |source: &mut Source| {
                source.set_indexed_property(
                    instance,
                    MeasurementFrameInfo {
                        label: frame.label.clone(),
                        width: frame.width(),
                        height: frame.height(),
                        background: frame.background,
                        gain: frame.gain,
                    },
                );
                Ok(())
            }))
        } else if kind == PropertyKind::of::<MeasurementFrameCoordinates>() {
            Some(source_task(move |source: &mut Source| {
                source.set_indexed_property(
                    instance,
                    MeasurementFrameCoordinates {
                        coordinates: frame.coordinates.clone(),
                    },
                );
                Ok(())
            }))
        } else if kind == PropertyKind::of::<MeasurementFrameRectangle>() {
            Some(source_task(move |source: &mut Source| {
                compute_rectangle(source, instance)
            }))
        } else {
            None
        }
    }
}
