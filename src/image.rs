use std::sync::Arc;

/// A decoded raster image.
///
/// This is intentionally minimal: the pipeline core does not draw, decompress
/// or colour-manage images, it only moves them between stages and measures
/// their cache cost. Concrete decoders hand back whatever pixel buffer they
/// produced; view-layer crates are expected to wrap this in their own handle
/// type.
#[derive(Debug, Clone)]
pub struct Image {
    width: u32,
    height: u32,
    bytes_per_row: u32,
    pixels: Arc<Vec<u8>>,
}

impl Image {
    pub fn new(width: u32, height: u32, bytes_per_row: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, bytes_per_row, pixels: Arc::new(pixels) }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.bytes_per_row
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Cost estimate used by the memory cache: raster size in bytes.
    ///
    /// OSX historically reports a constant cost of 1 here (the platform's own
    /// image representation already accounts for memory pressure through
    /// other means); everywhere else it's width * bytes-per-row.
    pub fn estimate_cost(&self) -> usize {
        if cfg!(target_os = "macos") {
            1
        } else {
            self.width as usize * self.bytes_per_row as usize
        }
    }
}
