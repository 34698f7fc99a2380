use std::fmt;
use std::sync::Arc;

use crate::coordinates::{CoordinateSystem, IdentityCoordinates};
use crate::tile::TiledImage;

/// An image together with what is needed to interpret its pixels.
#[derive(Clone)]
pub struct Frame {
    pub label: String,
    pub image: TiledImage,
    pub background: f64,
    /// Detection threshold above background.
    pub threshold: f64,
    pub gain: f64,
    /// Saturation level; `0` when unknown.
    pub saturation: f64,
    pub coordinates: Arc<dyn CoordinateSystem>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("label", &self.label)
            .field("image", &self.image.label())
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("background", &self.background)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Frame {
    pub fn new(image: TiledImage) -> Self {
        Self {
            label: image.label().to_string(),
            image,
            background: 0.0,
            threshold: 0.0,
            gain: 1.0,
            saturation: 0.0,
            coordinates: Arc::new(IdentityCoordinates),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_saturation(mut self, saturation: f64) -> Self {
        self.saturation = saturation;
        self
    }

    pub fn with_coordinates(mut self, coordinates: Arc<dyn CoordinateSystem>) -> Self {
        self.coordinates = coordinates;
        self
    }

    pub fn width(&self) -> usize {
        self.image.width()
    }

    pub fn height(&self) -> usize {
        self.image.height()
    }

    /// True if `value` reaches the saturation level.
    pub fn is_saturated(&self, value: f64) -> bool {
        self.saturation > 0.0 && value >= self.saturation
    }
}
