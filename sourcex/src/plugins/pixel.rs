//! Measurements derived directly from a source's detection pixels.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigDependencies};
use crate::entity::{Entity, Source};
use crate::error::{Error, Result};
use crate::plugins::detection::{DetectionFrame, PixelCoordinateList};
use crate::property::{Property, PropertyId, PropertyKind};
use crate::task::{source_task, Task, TaskFactory};

/// Magnitude written when the flux is not positive.
pub const MAGNITUDE_SENTINEL: f64 = 99.0;

/// Inclusive pixel bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBoundaries {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl PixelBoundaries {
    pub fn width(&self) -> i64 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> i64 {
        self.max_y - self.min_y + 1
    }

    pub fn union(&self, other: &PixelBoundaries) -> PixelBoundaries {
        PixelBoundaries {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

impl Property for PixelBoundaries {
    const NAME: &'static str = "PixelBoundaries";
}

/// Background-subtracted values of the detection pixels, in
/// [`PixelCoordinateList`] order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PixelValues {
    pub values: Vec<f64>,
}

impl Property for PixelValues {
    const NAME: &'static str = "PixelValues";
}

/// Brightest pixel above background.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakValue {
    pub value: f64,
}

impl Property for PeakValue {
    const NAME: &'static str = "PeakValue";
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IsophotalFlux {
    pub flux: f64,
    pub magnitude: f64,
}

impl Property for IsophotalFlux {
    const NAME: &'static str = "IsophotalFlux";
}

/// Flux-weighted barycenter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelCentroid {
    pub x: f64,
    pub y: f64,
}

impl Property for PixelCentroid {
    const NAME: &'static str = "PixelCentroid";
}

/// `plugins.photometry` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    pub magnitude_zero_point: f64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            magnitude_zero_point: 0.0,
        }
    }
}

pub const PHOTOMETRY_SECTION: &str = "photometry";

fn compute_boundaries(source: &mut Source) -> Result<()> {
    let pixels = source.get_property::<PixelCoordinateList>()?;
    let Some(first) = pixels.coordinates.first() else {
        return Err(Error::Measurement {
            property: PixelBoundaries::NAME,
            reason: "source has no pixels".to_string(),
        });
    };
    let mut bounds = PixelBoundaries {
        min_x: first.x,
        min_y: first.y,
        max_x: first.x,
        max_y: first.y,
    };
    for p in &pixels.coordinates[1..] {
        bounds.min_x = bounds.min_x.min(p.x);
        bounds.min_y = bounds.min_y.min(p.y);
        bounds.max_x = bounds.max_x.max(p.x);
        bounds.max_y = bounds.max_y.max(p.y);
    }
    source.set_property(bounds);
    Ok(())
}

fn compute_values(source: &mut Source) -> Result<()> {
    let frame = source.get_property::<DetectionFrame>()?;
    let pixels = source.get_property::<PixelCoordinateList>()?;
    let frame = &frame.frame;
    let values = pixels
        .coordinates
        .iter()
        .map(|p| {
            let value = frame.image.value_f64(p.x as usize, p.y as usize)?;
            Ok(value - frame.background)
        })
        .collect::<Result<Vec<_>>>()?;
    source.set_property(PixelValues { values });
    Ok(())
}

fn compute_peak(source: &mut Source) -> Result<()> {
    let values = source.get_property::<PixelValues>()?;
    let value = values
        .values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    source.set_property(PeakValue { value });
    Ok(())
}

fn compute_centroid(source: &mut Source) -> Result<()> {
    let pixels = source.get_property::<PixelCoordinateList>()?;
    let values = source.get_property::<PixelValues>()?;

    let (mut sum, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
    for (p, &v) in pixels.coordinates.iter().zip(&values.values) {
        sum += v;
        sum_x += v * p.x as f64;
        sum_y += v * p.y as f64;
    }
    if sum <= 0.0 {
        return Err(Error::Measurement {
            property: PixelCentroid::NAME,
            reason: format!("total flux {} is not positive", sum),
        });
    }
    source.set_property(PixelCentroid {
        x: sum_x / sum,
        y: sum_y / sum,
    });
    Ok(())
}

/// Produces the pixel-level properties of a source.
#[derive(Debug, Default)]
pub struct PixelTaskFactory {
    photometry: PhotometryConfig,
}

impl TaskFactory for PixelTaskFactory {
    fn name(&self) -> &'static str {
        "pixel"
    }

    fn produced_properties(&self) -> Vec<PropertyKind> {
        vec![
            PropertyKind::of::<PixelBoundaries>(),
            PropertyKind::of::<PixelValues>(),
            PropertyKind::of::<PeakValue>(),
            PropertyKind::of::<IsophotalFlux>(),
            PropertyKind::of::<PixelCentroid>(),
        ]
    }

    fn report_config_dependencies(&self, deps: &mut ConfigDependencies) {
        deps.declare(PHOTOMETRY_SECTION);
    }

    fn configure(&mut self, config: &Config) -> Result<()> {
        self.photometry = config.plugin_section(PHOTOMETRY_SECTION)?;
        Ok(())
    }

    fn create_source_task(&self, id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        if id.instance != 0 {
            return None;
        }
        let kind = id.kind;
        if kind == PropertyKind::of::<PixelBoundaries>() {
            Some(source_task(compute_boundaries))
        } else if kind == PropertyKind::of::<PixelValues>() {
            Some(source_task(compute_values))
        } else if kind == PropertyKind::of::<PeakValue>() {
            Some(source_task(compute_peak))
        } else if kind == PropertyKind::of::<PixelCentroid>() {
            Some(source_task(compute_centroid))
        } else if kind == PropertyKind::of::<IsophotalFlux>() {
            let zero_point = self.photometry.magnitude_zero_point;
            Some(source_task(move |source: &mut Source| {
                let values = source.get_property::<PixelValues>()?;
                let flux: f64 = values.values.iter().sum();
                let magnitude = if flux > 0.0 {
                    zero_point - 2.5 * flux.log10()
                } else {
                    MAGNITUDE_SENTINEL
                };
                source.set_property(IsophotalFlux { flux, magnitude });
                Ok(())
            }))
        } else {
            None
        }
    }
}
