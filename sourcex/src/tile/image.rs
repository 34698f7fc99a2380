use std::sync::Arc;

use common::Buffer2;

use super::{ImageId, ImageInfo, Pixel, PixelKind, TileStore};
use crate::error::{Error, Result};

/// Pixel-addressed view of one image registered in a [`TileStore`].
///
/// Every access goes through the store, so the view itself holds no tiles.
#[derive(Clone, Debug)]
pub struct TiledImage {
    store: Arc<TileStore>,
    image: ImageId,
    info: ImageInfo,
}

impl TiledImage {
    pub fn new(store: Arc<TileStore>, image: ImageId) -> Result<Self> {
        let info = store
            .image_info(image)
            .ok_or_else(|| Error::Config(format!("{} is not registered", image)))?;
        Ok(Self { store, image, info })
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    pub fn id(&self) -> ImageId {
        self.image
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn width(&self) -> usize {
        self.info.width
    }

    pub fn height(&self) -> usize {
        self.info.height
    }

    pub fn kind(&self) -> PixelKind {
        self.info.kind
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.info.width && (y as usize) < self.info.height
    }

    /// Panics if `T` is not the image's pixel kind.
    pub fn value<T: Pixel>(&self, x: usize, y: usize) -> Result<T> {
        let tile = self.store.get_tile(self.image, x, y)?;
        let value = tile.read().get::<T>(x, y);
        Ok(value)
    }

    pub fn value_f64(&self, x: usize, y: usize) -> Result<f64> {
        let tile = self.store.get_tile(self.image, x, y)?;
        let value = tile.read().get_f64(x, y);
        Ok(value)
    }

    /// Panics if `T` is not the image's pixel kind.
    pub fn set_value<T: Pixel>(&self, x: usize, y: usize, value: T) -> Result<()> {
        let tile = self.store.get_tile(self.image, x, y)?;
        tile.write().set(x, y, value);
        Ok(())
    }

    pub fn set_f64(&self, x: usize, y: usize, value: f64) -> Result<()> {
        let tile = self.store.get_tile(self.image, x, y)?;
        tile.write().set_f64(x, y, value);
        Ok(())
    }

    /// Copies `[x, x + width) × [y, y + height)` into a buffer, converting
    /// pixels to `f64`. The window may span any number of tiles.
    pub fn read_window(
        &self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Buffer2<f64>> {
        if x + width > self.info.width || y + height > self.info.height {
            return Err(Error::OutOfBounds {
                image: self.info.label.clone(),
                x: x + width,
                y: y + height,
                width: self.info.width,
                height: self.info.height,
            });
        }

        let mut out = Buffer2::new_default(width, height);
        let mut tile_y = y;
        while tile_y < y + height {
            let mut tile_x = x;
            let mut next_y = y + height;
            while tile_x < x + width {
                let handle = self.store.get_tile(self.image, tile_x, tile_y)?;
                let tile = handle.read();
                let x_end = (tile.x() + tile.width()).min(x + width);
                let y_end = (tile.y() + tile.height()).min(y + height);
                for py in tile_y..y_end {
                    for px in tile_x..x_end {
                        out[(px - x, py - y)] = tile.get_f64(px, py);
                    }
                }
                next_y = y_end;
                tile_x = x_end;
            }
            tile_y = next_y;
        }
        Ok(out)
    }

    pub fn read_row(&self, y: usize) -> Result<Vec<f64>> {
        Ok(self.read_window(0, y, self.info.width, 1)?.into_vec())
    }
}
