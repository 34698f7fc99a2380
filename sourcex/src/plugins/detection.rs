//! Properties attached to a source when it is detected.

use std::sync::Arc;

use crate::frame::Frame;
use crate::property::Property;

/// Order in which the segmentation emitted the detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectionId(pub u64);

impl Property for DetectionId {
    const NAME: &'static str = "DetectionId";
}

/// Canonical catalog id; contiguous within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl Property for SourceId {
    const NAME: &'static str = "SourceId";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelCoordinate {
    pub x: i64,
    pub y: i64,
}

impl PixelCoordinate {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PixelCoordinateList {
    pub coordinates: Vec<PixelCoordinate>,
}

impl PixelCoordinateList {
    pub fn new(coordinates: Vec<PixelCoordinate>) -> Self {
        Self { coordinates }
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }
}

impl Property for PixelCoordinateList {
    const NAME: &'static str = "PixelCoordinateList";
}

/// The frame a source was detected on.
#[derive(Clone, Debug)]
pub struct DetectionFrame {
    pub frame: Arc<Frame>,
}

impl Property for DetectionFrame {
    const NAME: &'static str = "DetectionFrame";
}
