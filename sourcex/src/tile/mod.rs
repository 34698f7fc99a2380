//! Tiled pixel storage.
//!
//! Images are cut into a grid of tiles that are loaded on demand from a
//! [`PixelSource`], kept in a [`TileStore`] under a byte budget and written
//! back when they were modified. The pixel kind is chosen at runtime, so a
//! tile stores one of five typed buffers in [`TileData`].

mod image;
mod source;
mod store;


use std::fmt::Debug;

use bytemuck::Pod;
use common::Buffer2;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

pub use image::TiledImage;
pub use source::{ComputedSource, MemorySource, PixelSource, RawFileSource};
pub use store::{ImageId, ImageInfo, LostTile, TileHandle, TileStats, TileStore, TileStoreConfig};

/// Numeric kind of the pixels stored in a tile.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PixelKind {
    Float32,
    Float64,
    Int32,
    UInt32,
    Int64,
}

impl PixelKind {
    pub fn byte_size(self) -> usize {
        match self {
            PixelKind::Float32 | PixelKind::Int32 | PixelKind::UInt32 => 4,
            PixelKind::Float64 | PixelKind::Int64 => 8,
        }
    }
}

/// A pixel type a tile can be read or written as.
pub trait Pixel:
    Pod + NumCast + ToPrimitive + Default + PartialOrd + Debug + Send + Sync + 'static
{
    const KIND: PixelKind;

    fn buffer(data: &TileData) -> Option<&Buffer2<Self>>;

    fn buffer_mut(data: &mut TileData) -> Option<&mut Buffer2<Self>>;

    fn into_data(buffer: Buffer2<Self>) -> TileData;
}

macro_rules! impl_pixel {
    ($ty:ty, $variant:ident) => {
        impl Pixel for $ty {
            const KIND: PixelKind = PixelKind::$variant;

            fn buffer(data: &TileData) -> Option<&Buffer2<Self>> {
                match data {
                    TileData::$variant(buffer) => Some(buffer),
                    _ => None,
                }
            }

            fn buffer_mut(data: &mut TileData) -> Option<&mut Buffer2<Self>> {
                match data {
                    TileData::$variant(buffer) => Some(buffer),
                    _ => None,
                }
            }

            fn into_data(buffer: Buffer2<Self>) -> TileData {
                TileData::$variant(buffer)
            }
        }
    };
}

impl_pixel!(f32, Float32);
impl_pixel!(f64, Float64);
impl_pixel!(i32, Int32);
impl_pixel!(u32, UInt32);
impl_pixel!(i64, Int64);

/// Pixel storage tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    Float32(Buffer2<f32>),
    Float64(Buffer2<f64>),
    Int32(Buffer2<i32>),
    UInt32(Buffer2<u32>),
    Int64(Buffer2<i64>),
}

macro_rules! with_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            TileData::Float32($buf) => $body,
            TileData::Float64($buf) => $body,
            TileData::Int32($buf) => $body,
            TileData::UInt32($buf) => $body,
            TileData::Int64($buf) => $body,
        }
    };
}

macro_rules! map_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            TileData::Float32($buf) => TileData::Float32($body),
            TileData::Float64($buf) => TileData::Float64($body),
            TileData::Int32($buf) => TileData::Int32($body),
            TileData::UInt32($buf) => TileData::UInt32($body),
            TileData::Int64($buf) => TileData::Int64($body),
        }
    };
}

fn pod_from_bytes<T: Pod>(bytes: &[u8], len: usize) -> Vec<T> {
    let mut values = vec![T::zeroed(); len];
    bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(bytes);
    values
}

impl TileData {
    pub fn zeroed(kind: PixelKind, width: usize, height: usize) -> Self {
        match kind {
            PixelKind::Float32 => TileData::Float32(Buffer2::new_default(width, height)),
            PixelKind::Float64 => TileData::Float64(Buffer2::new_default(width, height)),
            PixelKind::Int32 => TileData::Int32(Buffer2::new_default(width, height)),
            PixelKind::UInt32 => TileData::UInt32(Buffer2::new_default(width, height)),
            PixelKind::Int64 => TileData::Int64(Buffer2::new_default(width, height)),
        }
    }

    /// Builds `kind` pixels from `f64` values, saturating at the kind's range.
    pub fn from_fn<F>(kind: PixelKind, width: usize, height: usize, f: F) -> Self
    where
        F: Fn(usize, usize) -> f64,
    {
        match kind {
            PixelKind::Float32 => TileData::Float32(Buffer2::from_fn(width, height, |x, y| {
                f(x, y) as f32
            })),
            PixelKind::Float64 => TileData::Float64(Buffer2::from_fn(width, height, &f)),
            PixelKind::Int32 => {
                TileData::Int32(Buffer2::from_fn(width, height, |x, y| f(x, y) as i32))
            }
            PixelKind::UInt32 => {
                TileData::UInt32(Buffer2::from_fn(width, height, |x, y| f(x, y) as u32))
            }
            PixelKind::Int64 => {
                TileData::Int64(Buffer2::from_fn(width, height, |x, y| f(x, y) as i64))
            }
        }
    }

    /// Reinterprets native-endian bytes as `width × height` pixels of `kind`.
    pub fn from_bytes(kind: PixelKind, width: usize, height: usize, bytes: &[u8]) -> Self {
        let len = width * height;
        assert_eq!(
            bytes.len(),
            len * kind.byte_size(),
            "byte length does not match {}x{} {} pixels",
            width,
            height,
            kind
        );
        match kind {
            PixelKind::Float32 => TileData::Float32(Buffer2::new(width, height, pod_from_bytes(bytes, len))),
            PixelKind::Float64 => TileData::Float64(Buffer2::new(width, height, pod_from_bytes(bytes, len))),
            PixelKind::Int32 => TileData::Int32(Buffer2::new(width, height, pod_from_bytes(bytes, len))),
            PixelKind::UInt32 => TileData::UInt32(Buffer2::new(width, height, pod_from_bytes(bytes, len))),
            PixelKind::Int64 => TileData::Int64(Buffer2::new(width, height, pod_from_bytes(bytes, len))),
        }
    }

    pub fn kind(&self) -> PixelKind {
        match self {
            TileData::Float32(_) => PixelKind::Float32,
            TileData::Float64(_) => PixelKind::Float64,
            TileData::Int32(_) => PixelKind::Int32,
            TileData::UInt32(_) => PixelKind::UInt32,
            TileData::Int64(_) => PixelKind::Int64,
        }
    }

    pub fn width(&self) -> usize {
        with_buffer!(self, buf => buf.width())
    }

    pub fn height(&self) -> usize {
        with_buffer!(self, buf => buf.height())
    }

    pub fn byte_size(&self) -> usize {
        self.width() * self.height() * self.kind().byte_size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        with_buffer!(self, buf => bytemuck::cast_slice(buf.pixels()))
    }

    pub fn get_f64(&self, x: usize, y: usize) -> f64 {
        with_buffer!(self, buf => buf.get(x, y).to_f64().unwrap_or(f64::NAN))
    }

    pub fn set_f64(&mut self, x: usize, y: usize, value: f64) {
        match self {
            TileData::Float32(buf) => *buf.get_mut(x, y) = value as f32,
            TileData::Float64(buf) => *buf.get_mut(x, y) = value,
            TileData::Int32(buf) => *buf.get_mut(x, y) = value as i32,
            TileData::UInt32(buf) => *buf.get_mut(x, y) = value as u32,
            TileData::Int64(buf) => *buf.get_mut(x, y) = value as i64,
        }
    }

    pub fn window(&self, x: usize, y: usize, width: usize, height: usize) -> Self {
        map_buffer!(self, buf => buf.window(x, y, width, height))
    }

    /// Pastes `src` at `(x, y)`. Both sides must hold the same kind.
    pub fn paste(&mut self, src: &TileData, x: usize, y: usize) {
        match (self, src) {
            (TileData::Float32(dst), TileData::Float32(src)) => dst.paste(src, x, y),
            (TileData::Float64(dst), TileData::Float64(src)) => dst.paste(src, x, y),
            (TileData::Int32(dst), TileData::Int32(src)) => dst.paste(src, x, y),
            (TileData::UInt32(dst), TileData::UInt32(src)) => dst.paste(src, x, y),
            (TileData::Int64(dst), TileData::Int64(src)) => dst.paste(src, x, y),
            (dst, src) => panic!("cannot paste {} pixels into {} data", src.kind(), dst.kind()),
        }
    }
}

/// A resident window `[x, x + width) × [y, y + height)` of an image.
#[derive(Debug)]
pub struct Tile {
    image: ImageId,
    x: usize,
    y: usize,
    data: TileData,
    dirty: bool,
}

impl Tile {
    pub(crate) fn new(image: ImageId, x: usize, y: usize, data: TileData) -> Self {
        Self {
            image,
            x,
            y,
            data,
            dirty: false,
        }
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn x(&self) -> usize {
        self.x
    }

    pub fn y(&self) -> usize {
        self.y
    }

    pub fn width(&self) -> usize {
        self.data.width()
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    pub fn kind(&self) -> PixelKind {
        self.data.kind()
    }

    pub fn byte_size(&self) -> usize {
        self.data.byte_size()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width() && y < self.y + self.height()
    }

    pub fn data(&self) -> &TileData {
        &self.data
    }

    /// Mutable access to the whole buffer; marks the tile dirty.
    pub fn data_mut(&mut self) -> &mut TileData {
        self.dirty = true;
        &mut self.data
    }

    /// Reads pixel `(x, y)` in image coordinates.
    ///
    /// Panics if `T` is not the tile's pixel kind.
    pub fn get<T: Pixel>(&self, x: usize, y: usize) -> T {
        assert!(self.contains(x, y), "pixel ({}, {}) is not in tile", x, y);
        let buffer = T::buffer(&self.data).unwrap_or_else(|| {
            panic!(
                "tile holds {} pixels, accessed as {}",
                self.kind(),
                T::KIND
            )
        });
        *buffer.get(x - self.x, y - self.y)
    }

    /// Writes pixel `(x, y)` in image coordinates and marks the tile dirty.
    ///
    /// Panics if `T` is not the tile's pixel kind.
    pub fn set<T: Pixel>(&mut self, x: usize, y: usize, value: T) {
        assert!(self.contains(x, y), "pixel ({}, {}) is not in tile", x, y);
        let (tile_x, tile_y, kind) = (self.x, self.y, self.kind());
        let buffer = T::buffer_mut(&mut self.data).unwrap_or_else(|| {
            panic!("tile holds {} pixels, accessed as {}", kind, T::KIND)
        });
        *buffer.get_mut(x - tile_x, y - tile_y) = value;
        self.dirty = true;
    }

    pub fn get_f64(&self, x: usize, y: usize) -> f64 {
        assert!(self.contains(x, y), "pixel ({}, {}) is not in tile", x, y);
        self.data.get_f64(x - self.x, y - self.y)
    }

    pub fn set_f64(&mut self, x: usize, y: usize, value: f64) {
        assert!(self.contains(x, y), "pixel ({}, {}) is not in tile", x, y);
        self.data.set_f64(x - self.x, y - self.y, value);
        self.dirty = true;
    }
}
