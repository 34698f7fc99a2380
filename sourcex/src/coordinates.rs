//! Mapping between pixel and world coordinates.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImageCoordinate {
    pub x: f64,
    pub y: f64,
}

impl ImageCoordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WorldCoordinate {
    pub alpha: f64,
    pub delta: f64,
}

impl WorldCoordinate {
    pub fn new(alpha: f64, delta: f64) -> Self {
        Self { alpha, delta }
    }
}

/// Projection of one frame. Both directions fail with
/// [`Error::InvalidCoordinates`] where the projection is undefined.
pub trait CoordinateSystem: Send + Sync + fmt::Debug {
    fn image_to_world(&self, image: ImageCoordinate) -> Result<WorldCoordinate>;

    fn world_to_image(&self, world: WorldCoordinate) -> Result<ImageCoordinate>;
}

/// World coordinates equal to pixel coordinates.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCoordinates;

impl CoordinateSystem for IdentityCoordinates {
    fn image_to_world(&self, image: ImageCoordinate) -> Result<WorldCoordinate> {
        Ok(WorldCoordinate::new(image.x, image.y))
    }

    fn world_to_image(&self, world: WorldCoordinate) -> Result<ImageCoordinate> {
        Ok(ImageCoordinate::new(world.alpha, world.delta))
    }
}

/// `world = origin + matrix · pixel`, optionally limited to a world-space
/// rectangle outside of which the projection is invalid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineCoordinates {
    origin: WorldCoordinate,
    // row-major [[a, b], [c, d]]
    matrix: [f64; 4],
    valid: Option<(WorldCoordinate, WorldCoordinate)>,
}

impl AffineCoordinates {
    pub fn new(origin: WorldCoordinate, matrix: [f64; 4]) -> Result<Self> {
        let det = matrix[0] * matrix[3] - matrix[1] * matrix[2];
        if det == 0.0 || !det.is_finite() {
            return Err(Error::Config(format!(
                "affine matrix {:?} is not invertible",
                matrix
            )));
        }
        Ok(Self {
            origin,
            matrix,
            valid: None,
        })
    }

    /// Pure translation: world = pixel + (dx, dy).
    pub fn offset(dx: f64, dy: f64) -> Self {
        Self {
            origin: WorldCoordinate::new(dx, dy),
            matrix: [1.0, 0.0, 0.0, 1.0],
            valid: None,
        }
    }

    pub fn with_valid_region(mut self, min: WorldCoordinate, max: WorldCoordinate) -> Self {
        self.valid = Some((min, max));
        self
    }

    fn check(&self, world: WorldCoordinate) -> Result<()> {
        if !world.alpha.is_finite() || !world.delta.is_finite() {
            return Err(Error::InvalidCoordinates(format!(
                "non-finite world coordinate ({}, {})",
                world.alpha, world.delta
            )));
        }
        if let Some((min, max)) = self.valid {
            let inside = world.alpha >= min.alpha
                && world.alpha <= max.alpha
                && world.delta >= min.delta
                && world.delta <= max.delta;
            if !inside {
                return Err(Error::InvalidCoordinates(format!(
                    "({}, {}) is outside the projection domain",
                    world.alpha, world.delta
                )));
            }
        }
        Ok(())
    }
}

impl CoordinateSystem for AffineCoordinates {
    fn image_to_world(&self, image: ImageCoordinate) -> Result<WorldCoordinate> {
        let [a, b, c, d] = self.matrix;
        let world = WorldCoordinate::new(
            self.origin.alpha + a * image.x + b * image.y,
            self.origin.delta + c * image.x + d * image.y,
        );
        self.check(world)?;
        Ok(world)
    }

    fn world_to_image(&self, world: WorldCoordinate) -> Result<ImageCoordinate> {
        self.check(world)?;
        let [a, b, c, d] = self.matrix;
        let det = a * d - b * c;
        let u = world.alpha - self.origin.alpha;
        let v = world.delta - self.origin.delta;
        Ok(ImageCoordinate::new((d * u - b * v) / det, (a * v - c * u) / det))
    }
}
