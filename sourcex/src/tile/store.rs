use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{PixelKind, PixelSource, Tile, TileData};
use crate::error::{Error, Result};

/// Tile grid and memory budget of a [`TileStore`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileStoreConfig {
    pub tile_width: usize,
    pub tile_height: usize,
    /// Upper bound on resident tile bytes. Tiles with live handles may
    /// push the store above it.
    pub max_memory_bytes: usize,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            tile_width: 256,
            tile_height: 256,
            max_memory_bytes: 512 * 1024 * 1024,
        }
    }
}

impl TileStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(Error::Config(format!(
                "tile size must be positive, got {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u32);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// Geometry and identity of a registered image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInfo {
    pub label: String,
    pub kind: PixelKind,
    pub width: usize,
    pub height: usize,
}

/// A modified tile whose eviction write-back failed.
#[derive(Clone, Debug)]
pub struct LostTile {
    pub image: String,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileStats {
    pub loads: u64,
    pub hits: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub resident_bytes: usize,
    pub resident_tiles: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TileKey {
    image: ImageId,
    x: usize,
    y: usize,
}

struct ImageEntry {
    info: ImageInfo,
    source: Option<Arc<dyn PixelSource>>,
}

struct Resident {
    slot: Arc<RwLock<Tile>>,
    handles: usize,
    released_at: Option<u64>,
    bytes: usize,
}

#[derive(Default)]
struct StoreState {
    images: Vec<ImageEntry>,
    tiles: HashMap<TileKey, Resident>,
    // release tick -> tile, oldest first
    idle: BTreeMap<u64, TileKey>,
    clock: u64,
    resident_bytes: usize,
    stats: TileStats,
    lost: Vec<LostTile>,
    // evicted dirty tiles of scratch images
    scratch_spill: HashMap<TileKey, TileData>,
    // evicted dirty tiles whose write-back has not finished, with the
    // number of outstanding writes
    writing_back: HashMap<TileKey, (Arc<RwLock<Tile>>, usize)>,
}

/// An evicted dirty tile to be written back once the state lock is
/// released.
struct WriteBack {
    key: TileKey,
    slot: Arc<RwLock<Tile>>,
    source: Arc<dyn PixelSource>,
    label: String,
}

/// Shared cache of image tiles loaded on demand under a memory budget.
///
/// Tiles are aligned on a `tile_width × tile_height` grid and clipped to
/// the image, so resident tiles of one image never overlap. A tile is
/// evictable once its last [`TileHandle`] is dropped; evictable tiles go
/// least recently released first and are written back if dirty.
pub struct TileStore {
    config: TileStoreConfig,
    state: Mutex<StoreState>,
}

impl fmt::Debug for TileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileStore")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TileStore {
    pub fn new(config: TileStoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn config(&self) -> &TileStoreConfig {
        &self.config
    }

    pub fn register(&self, source: Arc<dyn PixelSource>) -> ImageId {
        let info = ImageInfo {
            label: source.identity(),
            kind: source.kind(),
            width: source.width(),
            height: source.height(),
        };
        self.add_image(info, Some(source))
    }

    /// Registers an image without backing storage; its tiles start zeroed.
    pub fn register_scratch(
        &self,
        label: impl Into<String>,
        kind: PixelKind,
        width: usize,
        height: usize,
    ) -> ImageId {
        let info = ImageInfo {
            label: label.into(),
            kind,
            width,
            height,
        };
        self.add_image(info, None)
    }

    fn add_image(&self, info: ImageInfo, source: Option<Arc<dyn PixelSource>>) -> ImageId {
        let mut state = self.state.lock();
        let id = ImageId(state.images.len() as u32);
        tracing::debug!(
            image = %info.label,
            width = info.width,
            height = info.height,
            kind = %info.kind,
            "registered image"
        );
        state.images.push(ImageEntry { info, source });
        id
    }

    pub fn image_info(&self, image: ImageId) -> Option<ImageInfo> {
        let state = self.state.lock();
        state
            .images
            .get(image.0 as usize)
            .map(|entry| entry.info.clone())
    }

    /// Returns a handle to the tile covering pixel `(x, y)`, loading it if
    /// it is not resident.
    pub fn get_tile(self: &Arc<Self>, image: ImageId, x: usize, y: usize) -> Result<TileHandle> {
        let mut state = self.state.lock();
        let (info, source) = match state.images.get(image.0 as usize) {
            Some(entry) => (entry.info.clone(), entry.source.clone()),
            None => return Err(Error::Config(format!("{} is not registered", image))),
        };
        if x >= info.width || y >= info.height {
            return Err(Error::OutOfBounds {
                image: info.label,
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }

        let key = TileKey {
            image,
            x: x / self.config.tile_width * self.config.tile_width,
            y: y / self.config.tile_height * self.config.tile_height,
        };

        if let Some(resident) = state.tiles.get_mut(&key) {
            resident.handles += 1;
            let released_at = resident.released_at.take();
            let slot = resident.slot.clone();
            if let Some(tick) = released_at {
                state.idle.remove(&tick);
            }
            state.stats.hits += 1;
            return Ok(TileHandle {
                store: self.clone(),
                key,
                slot,
            });
        }

        // evicted but still being written: adopt it instead of reading
        // stale pixels from the source
        if let Some(slot) = state.writing_back.get(&key).map(|(slot, _)| slot.clone()) {
            let bytes = slot.read().byte_size();
            state.tiles.insert(
                key,
                Resident {
                    slot: slot.clone(),
                    handles: 1,
                    released_at: None,
                    bytes,
                },
            );
            state.resident_bytes += bytes;
            state.stats.hits += 1;
            let pending = self.evict_over_budget(&mut state);
            drop(state);
            self.write_back(pending);
            return Ok(TileHandle {
                store: self.clone(),
                key,
                slot,
            });
        }

        let width = self.config.tile_width.min(info.width - key.x);
        let height = self.config.tile_height.min(info.height - key.y);
        let (data, spilled) = match source {
            Some(source) => {
                let data = source.read(key.x, key.y, width, height).map_err(|source| {
                    Error::TileLoad {
                        image: info.label.clone(),
                        x: key.x,
                        y: key.y,
                        width,
                        height,
                        source,
                    }
                })?;
                debug_assert_eq!(data.kind(), info.kind);
                (data, false)
            }
            None => match state.scratch_spill.remove(&key) {
                Some(data) => (data, true),
                None => (TileData::zeroed(info.kind, width, height), false),
            },
        };

        let mut tile = Tile::new(image, key.x, key.y, data);
        if spilled {
            // still only in memory, must be spilled again on eviction
            tile.data_mut();
        }
        let bytes = tile.byte_size();
        let slot = Arc::new(RwLock::new(tile));
        state.tiles.insert(
            key,
            Resident {
                slot: slot.clone(),
                handles: 1,
                released_at: None,
                bytes,
            },
        );
        state.resident_bytes += bytes;
        state.stats.loads += 1;
        tracing::trace!(%image, tile_x = key.x, tile_y = key.y, width, height, "loaded tile");

        let pending = self.evict_over_budget(&mut state);
        drop(state);
        self.write_back(pending);

        Ok(TileHandle {
            store: self.clone(),
            key,
            slot,
        })
    }

    fn acquire(&self, key: TileKey) {
        let mut state = self.state.lock();
        if let Some(resident) = state.tiles.get_mut(&key) {
            resident.handles += 1;
        }
    }

    fn release(&self, key: TileKey) {
        let mut state = self.state.lock();
        let tick = state.clock;
        let Some(resident) = state.tiles.get_mut(&key) else {
            return;
        };
        resident.handles -= 1;
        if resident.handles == 0 {
            resident.released_at = Some(tick);
            state.clock += 1;
            state.idle.insert(tick, key);
            let pending = self.evict_over_budget(&mut state);
            drop(state);
            self.write_back(pending);
        }
    }

    /// Evicts idle tiles until the budget holds. Scratch tiles spill to
    /// memory here; tiles with a source are returned for
    /// [`TileStore::write_back`] so no I/O happens under the state lock.
    fn evict_over_budget(&self, state: &mut StoreState) -> Vec<WriteBack> {
        let mut pending = Vec::new();
        while state.resident_bytes > self.config.max_memory_bytes {
            let Some((_, key)) = state.idle.pop_first() else {
                break;
            };
            let Some(resident) = state.tiles.remove(&key) else {
                continue;
            };
            state.resident_bytes -= resident.bytes;
            state.stats.evictions += 1;

            if !resident.slot.read().is_dirty() {
                continue;
            }
            let entry = &state.images[key.image.0 as usize];
            match entry.source.clone() {
                None => {
                    let data = resident.slot.read().data().clone();
                    state.scratch_spill.insert(key, data);
                }
                Some(source) => {
                    let label = entry.info.label.clone();
                    state
                        .writing_back
                        .entry(key)
                        .or_insert_with(|| (resident.slot.clone(), 0))
                        .1 += 1;
                    pending.push(WriteBack {
                        key,
                        slot: resident.slot,
                        source,
                        label,
                    });
                }
            }
        }
        pending
    }

    fn write_back(&self, pending: Vec<WriteBack>) {
        for WriteBack {
            key,
            slot,
            source,
            label,
        } in pending
        {
            let (result, width, height) = {
                let tile = slot.read();
                (
                    source.write(key.x, key.y, tile.data()),
                    tile.width(),
                    tile.height(),
                )
            };

            let mut state = self.state.lock();
            if let Some((_, outstanding)) = state.writing_back.get_mut(&key) {
                *outstanding -= 1;
                if *outstanding == 0 {
                    state.writing_back.remove(&key);
                }
            }
            match result {
                Ok(()) => state.stats.write_backs += 1,
                Err(err) => {
                    tracing::error!(
                        image = %label,
                        tile_x = key.x,
                        tile_y = key.y,
                        error = %err,
                        "write-back of evicted tile failed, modifications lost"
                    );
                    state.lost.push(LostTile {
                        image: label,
                        x: key.x,
                        y: key.y,
                        width,
                        height,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Errors if any modified tile was lost on eviction.
    pub fn check_lost(&self) -> Result<()> {
        let state = self.state.lock();
        match state.lost.first() {
            None => Ok(()),
            Some(first) => Err(Error::TilesLost {
                count: state.lost.len(),
                image: first.image.clone(),
                x: first.x,
                y: first.y,
            }),
        }
    }

    pub fn lost_tiles(&self) -> Vec<LostTile> {
        self.state.lock().lost.clone()
    }

    /// Writes every dirty resident tile back to its source.
    ///
    /// Tiles of scratch images stay in memory. Returns the first write-back
    /// failure, or [`Error::TilesLost`] if an earlier eviction lost data.
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<(TileKey, Arc<RwLock<Tile>>, Arc<dyn PixelSource>, String)> = {
            let state = self.state.lock();
            state
                .tiles
                .iter()
                .filter(|(_, resident)| resident.slot.read().is_dirty())
                .filter_map(|(key, resident)| {
                    let entry = &state.images[key.image.0 as usize];
                    entry.source.as_ref().map(|source| {
                        (
                            *key,
                            resident.slot.clone(),
                            source.clone(),
                            entry.info.label.clone(),
                        )
                    })
                })
                .collect()
        };

        let results: Vec<Result<()>> = pending
            .par_iter()
            .map(|(key, slot, source, label)| {
                let mut tile = slot.write();
                source
                    .write(key.x, key.y, tile.data())
                    .map_err(|source| Error::TileWriteBack {
                        image: label.clone(),
                        x: key.x,
                        y: key.y,
                        width: tile.width(),
                        height: tile.height(),
                        source,
                    })?;
                tile.clear_dirty();
                Ok(())
            })
            .collect();

        let written = results.iter().filter(|result| result.is_ok()).count();
        self.state.lock().stats.write_backs += written as u64;
        tracing::debug!(written, pending = pending.len(), "flushed tile store");

        results.into_iter().collect::<Result<Vec<()>>>()?;
        self.check_lost()
    }

    pub fn stats(&self) -> TileStats {
        let state = self.state.lock();
        TileStats {
            resident_bytes: state.resident_bytes,
            resident_tiles: state.tiles.len(),
            ..state.stats
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.state.lock().resident_bytes
    }

    /// `(x, y, width, height)` of every resident tile of `image`.
    pub fn resident_windows(&self, image: ImageId) -> Vec<(usize, usize, usize, usize)> {
        let state = self.state.lock();
        let mut windows: Vec<_> = state
            .tiles
            .iter()
            .filter(|(key, _)| key.image == image)
            .map(|(key, resident)| {
                let tile = resident.slot.read();
                (key.x, key.y, tile.width(), tile.height())
            })
            .collect();
        windows.sort_unstable();
        windows
    }
}

impl Drop for TileStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(error = %err, "tile store flush on teardown failed");
        }
    }
}

/// Scoped access to one resident tile. The tile cannot be evicted while
/// any handle to it is alive.
pub struct TileHandle {
    store: Arc<TileStore>,
    key: TileKey,
    slot: Arc<RwLock<Tile>>,
}

impl TileHandle {
    pub fn read(&self) -> RwLockReadGuard<'_, Tile> {
        self.slot.read()
    }

    /// Exclusive access; pixel setters mark the tile dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Tile> {
        self.slot.write()
    }

    pub fn image(&self) -> ImageId {
        self.key.image
    }
}

impl fmt::Debug for TileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileHandle")
            .field("image", &self.key.image)
            .field("x", &self.key.x)
            .field("y", &self.key.y)
            .finish()
    }
}

impl Clone for TileHandle {
    fn clone(&self) -> Self {
        self.store.acquire(self.key);
        Self {
            store: self.store.clone(),
            key: self.key,
            slot: self.slot.clone(),
        }
    }
}

impl Drop for TileHandle {
    fn drop(&mut self) {
        self.store.release(self.key);
    }
}
