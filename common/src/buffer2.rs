use std::ops::{Deref, DerefMut, Index, IndexMut};
use std::slice;

/// Row-major 2-D buffer of pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> T,
    {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.width;
        &mut self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.pixels
    }

    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.pixels.iter()
    }

    pub fn map<U, F>(&self, f: F) -> Buffer2<U>
    where
        F: FnMut(&T) -> U,
    {
        Buffer2 {
            pixels: self.pixels.iter().map(f).collect(),
            width: self.width,
            height: self.height,
        }
    }
}

impl<T: Copy> Buffer2<T> {
    /// Copies the `width × height` window starting at `(x, y)` into a new buffer.
    pub fn window(&self, x: usize, y: usize, width: usize, height: usize) -> Self {
        assert!(
            x + width <= self.width && y + height <= self.height,
            "window {}x{} at ({}, {}) exceeds buffer {}x{}",
            width,
            height,
            x,
            y,
            self.width,
            self.height
        );
        let mut pixels = Vec::with_capacity(width * height);
        for row in y..y + height {
            pixels.extend_from_slice(&self.row(row)[x..x + width]);
        }
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Pastes the whole of `src` with its top-left corner at `(x, y)`.
    pub fn paste(&mut self, src: &Self, x: usize, y: usize) {
        assert!(
            x + src.width <= self.width && y + src.height <= self.height,
            "paste of {}x{} at ({}, {}) exceeds buffer {}x{}",
            src.width,
            src.height,
            x,
            y,
            self.width,
            self.height
        );
        for row in 0..src.height {
            self.row_mut(y + row)[x..x + src.width].copy_from_slice(src.row(row));
        }
    }
}

impl<T: Default + Clone> Buffer2<T> {
    pub fn new_default(width: usize, height: usize) -> Self {
        Self {
            pixels: vec![T::default(); width * height],
            width,
            height,
        }
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

impl<T> Deref for Buffer2<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.pixels
    }
}

impl<T> DerefMut for Buffer2<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pixels
    }
}

impl<T> From<Buffer2<T>> for Vec<T> {
    #[inline]
    fn from(buffer: Buffer2<T>) -> Self {
        buffer.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stores_dimensions() {
        let buf = Buffer2::new(3, 2, vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(buf.width(), 3);
        assert_eq!(buf.height(), 2);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    #[should_panic(expected = "pixels length must equal width * height")]
    fn new_panics_on_size_mismatch() {
        Buffer2::new(3, 2, vec![1, 2, 3]);
    }

    #[test]
    fn from_fn_is_row_major() {
        let buf = Buffer2::from_fn(3, 2, |x, y| x + 10 * y);
        assert_eq!(buf.pixels(), &[0, 1, 2, 10, 11, 12]);
        assert_eq!(*buf.get(2, 1), 12);
        assert_eq!(buf[(1, 1)], 11);
    }

    #[test]
    fn window_copies_sub_rectangle() {
        let buf = Buffer2::from_fn(4, 4, |x, y| x + 10 * y);
        let window = buf.window(1, 2, 2, 2);
        assert_eq!(window.width(), 2);
        assert_eq!(window.pixels(), &[21, 22, 31, 32]);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer")]
    fn window_out_of_range_panics() {
        let buf = Buffer2::<u8>::new_default(4, 4);
        buf.window(3, 3, 2, 2);
    }

    #[test]
    fn paste_overwrites_target_region() {
        let mut dst = Buffer2::new_filled(4, 3, 0);
        let src = Buffer2::new_filled(2, 2, 7);
        dst.paste(&src, 2, 1);
        assert_eq!(dst.row(0), &[0, 0, 0, 0]);
        assert_eq!(dst.row(1), &[0, 0, 7, 7]);
        assert_eq!(dst.row(2), &[0, 0, 7, 7]);
    }

    #[test]
    fn map_preserves_shape() {
        let buf = Buffer2::new(2, 1, vec![1i32, -2]);
        let mapped = buf.map(|&v| v as f64 * 0.5);
        assert_eq!(mapped.width(), 2);
        assert_eq!(mapped.pixels(), &[0.5, -1.0]);
    }
}
