//! Backing pixel sources the tile store loads from and writes back to.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::Buffer2;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use super::{Pixel, PixelKind, TileData};

/// Where tile pixels come from.
///
/// `read` must return exactly `width × height` pixels of [`PixelSource::kind`].
pub trait PixelSource: Send + Sync + fmt::Debug {
    /// Human readable identity used in logs and errors.
    fn identity(&self) -> String;

    fn kind(&self) -> PixelKind;

    fn width(&self) -> usize;

    fn height(&self) -> usize;

    fn read(&self, x: usize, y: usize, width: usize, height: usize) -> io::Result<TileData>;

    fn write(&self, x: usize, y: usize, data: &TileData) -> io::Result<()>;
}

fn check_window(
    source: &dyn PixelSource,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> io::Result<()> {
    if x + width > source.width() || y + height > source.height() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "window {}x{} at ({}, {}) exceeds {}x{}",
                width,
                height,
                x,
                y,
                source.width(),
                source.height()
            ),
        ));
    }
    Ok(())
}

/// Image held entirely in memory.
#[derive(Debug)]
pub struct MemorySource {
    label: String,
    data: RwLock<TileData>,
}

impl MemorySource {
    pub fn new(label: impl Into<String>, data: TileData) -> Self {
        Self {
            label: label.into(),
            data: RwLock::new(data),
        }
    }

    pub fn from_buffer<T: Pixel>(label: impl Into<String>, buffer: Buffer2<T>) -> Self {
        Self::new(label, T::into_data(buffer))
    }

    pub fn zeroed(label: impl Into<String>, kind: PixelKind, width: usize, height: usize) -> Self {
        Self::new(label, TileData::zeroed(kind, width, height))
    }

    /// Copy of the current image content.
    pub fn snapshot(&self) -> TileData {
        self.data.read().clone()
    }
}

impl PixelSource for MemorySource {
    fn identity(&self) -> String {
        self.label.clone()
    }

    fn kind(&self) -> PixelKind {
        self.data.read().kind()
    }

    fn width(&self) -> usize {
        self.data.read().width()
    }

    fn height(&self) -> usize {
        self.data.read().height()
    }

    fn read(&self, x: usize, y: usize, width: usize, height: usize) -> io::Result<TileData> {
        check_window(self, x, y, width, height)?;
        Ok(self.data.read().window(x, y, width, height))
    }

    fn write(&self, x: usize, y: usize, data: &TileData) -> io::Result<()> {
        check_window(self, x, y, data.width(), data.height())?;
        if data.kind() != self.kind() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cannot write {} pixels to {} image", data.kind(), self.kind()),
            ));
        }
        self.data.write().paste(data, x, y);
        Ok(())
    }
}

/// Headerless row-major raw image file in native byte order, memory-mapped.
pub struct RawFileSource {
    path: PathBuf,
    kind: PixelKind,
    width: usize,
    height: usize,
    mmap: Mutex<MmapMut>,
}

impl fmt::Debug for RawFileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFileSource")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl RawFileSource {
    /// Opens an existing raw file whose size must match the given geometry.
    pub fn open(
        path: impl AsRef<Path>,
        kind: PixelKind,
        width: usize,
        height: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = (width * height * kind.byte_size()) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "'{}' holds {} bytes, expected {} for {}x{} {}",
                    path.display(),
                    actual,
                    expected,
                    width,
                    height,
                    kind
                ),
            ));
        }
        Self::map(path, file, kind, width, height)
    }

    /// Creates (or truncates) a zero-filled raw file of the given geometry.
    pub fn create(
        path: impl AsRef<Path>,
        kind: PixelKind,
        width: usize,
        height: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((width * height * kind.byte_size()) as u64)?;
        Self::map(path, file, kind, width, height)
    }

    fn map(
        path: &Path,
        file: File,
        kind: PixelKind,
        width: usize,
        height: usize,
    ) -> io::Result<Self> {
        // SAFETY: the file is opened read-write by us and only accessed
        // through this mapping while the source is alive.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            width,
            height,
            mmap: Mutex::new(mmap),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row_range(&self, x: usize, y: usize, width: usize) -> std::ops::Range<usize> {
        let pixel = self.kind.byte_size();
        let start = (y * self.width + x) * pixel;
        start..start + width * pixel
    }
}

impl PixelSource for RawFileSource {
    fn identity(&self) -> String {
        self.path.display().to_string()
    }

    fn kind(&self) -> PixelKind {
        self.kind
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn read(&self, x: usize, y: usize, width: usize, height: usize) -> io::Result<TileData> {
        check_window(self, x, y, width, height)?;
        let mmap = self.mmap.lock();
        let mut bytes = Vec::with_capacity(width * height * self.kind.byte_size());
        for row in y..y + height {
            bytes.extend_from_slice(&mmap[self.row_range(x, row, width)]);
        }
        Ok(TileData::from_bytes(self.kind, width, height, &bytes))
    }

    fn write(&self, x: usize, y: usize, data: &TileData) -> io::Result<()> {
        check_window(self, x, y, data.width(), data.height())?;
        if data.kind() != self.kind {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cannot write {} pixels to {} file", data.kind(), self.kind),
            ));
        }
        let row_bytes = data.width() * self.kind.byte_size();
        let bytes = data.as_bytes();
        let mut mmap = self.mmap.lock();
        for row in 0..data.height() {
            let range = self.row_range(x, y + row, data.width());
            mmap[range].copy_from_slice(&bytes[row * row_bytes..(row + 1) * row_bytes]);
        }
        let first = self.row_range(x, y, data.width()).start;
        let last = self.row_range(x, y + data.height() - 1, data.width()).end;
        mmap.flush_range(first, last - first)
    }
}

type PixelFn = Arc<dyn Fn(usize, usize) -> f64 + Send + Sync>;

/// Read-only virtual image whose pixels are computed on demand.
#[derive(Clone)]
pub struct ComputedSource {
    label: String,
    kind: PixelKind,
    width: usize,
    height: usize,
    pixel: PixelFn,
}

impl fmt::Debug for ComputedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedSource")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl ComputedSource {
    pub fn new<F>(
        label: impl Into<String>,
        kind: PixelKind,
        width: usize,
        height: usize,
        pixel: F,
    ) -> Self
    where
        F: Fn(usize, usize) -> f64 + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            kind,
            width,
            height,
            pixel: Arc::new(pixel),
        }
    }
}

impl PixelSource for ComputedSource {
    fn identity(&self) -> String {
        self.label.clone()
    }

    fn kind(&self) -> PixelKind {
        self.kind
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn read(&self, x: usize, y: usize, width: usize, height: usize) -> io::Result<TileData> {
        check_window(self, x, y, width, height)?;
        let pixel = &self.pixel;
        Ok(TileData::from_fn(self.kind, width, height, |dx, dy| {
            pixel(x + dx, y + dy)
        }))
    }

    fn write(&self, _x: usize, _y: usize, _data: &TileData) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("'{}' is a read-only computed image", self.label),
        ))
    }
}
