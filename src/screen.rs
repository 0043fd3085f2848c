use crate::cache::{fingerprint, CacheConfig, CacheStats, Fingerprint, ScreenshotCache};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, ImageEncoder, ImageResult, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

// ========================= Frames =========================

#[derive(Clone)]
pub struct CaptureFrame {
    pub pixels: RgbImage,
    pub captured_at: SystemTime,
    pub fingerprint: Fingerprint,
    pub width: u32,
    pub height: u32,
}

impl fmt::Debug for CaptureFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fingerprint", &self.fingerprint)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub fingerprint: Fingerprint,
    pub width: u32,
    pub height: u32,
}

impl CaptureFrame {
    pub fn new(pixels: RgbImage) -> Self {
        let fingerprint = fingerprint(&pixels);
        Self {
            width: pixels.width(),
            height: pixels.height(),
            captured_at: SystemTime::now(),
            fingerprint,
            pixels,
        }
    }

    pub fn frame_ref(&self) -> FrameRef {
        FrameRef {
            fingerprint: self.fingerprint.clone(),
            width: self.width,
            height: self.height,
        }
    }

    pub fn to_png(&self) -> ImageResult<Vec<u8>> {
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf).write_image(
            self.pixels.as_raw(),
            self.width,
            self.height,
            ColorType::Rgb8,
        )?;
        Ok(buf)
    }

    pub fn to_png_base64(&self) -> ImageResult<String> {
        Ok(B64.encode(self.to_png()?))
    }
}

/// Largest size fitting in `max_width` x `max_height` with the same aspect
/// ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);
    if scale >= 1.0 {
        return (width, height);
    }
    let w = ((width as f64 * scale) as u32).max(1);
    let h = ((height as f64 * scale) as u32).max(1);
    (w, h)
}

pub fn downscale(image: RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (w, h) = fit_within(image.width(), image.height(), max_width, max_height);
    if (w, h) == image.dimensions() {
        return image;
    }
    debug!(from = ?image.dimensions(), to = ?(w, h), "downscaling capture");
    imageops::resize(&image, w, h, FilterType::Triangle)
}

// ========================= Pixel Sources =========================

#[async_trait]
pub trait PixelSource: Send + Sync {
    async fn capture(&self, monitor: usize, max_width: u32, max_height: u32) -> Option<CaptureFrame>;
}

#[async_trait]
impl<T: PixelSource + ?Sized> PixelSource for Arc<T> {
    async fn capture(&self, monitor: usize, max_width: u32, max_height: u32) -> Option<CaptureFrame> {
        (**self).capture(monitor, max_width, max_height).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlankScreen {
    pub width: u32,
    pub height: u32,
    pub color: [u8; 3],
}

impl Default for BlankScreen {
    fn default() -> Self {
        Self { width: 1920, height: 1080, color: [255, 255, 255] }
    }
}

#[async_trait]
impl PixelSource for BlankScreen {
    async fn capture(&self, _monitor: usize, max_width: u32, max_height: u32) -> Option<CaptureFrame> {
        let img = RgbImage::from_pixel(self.width, self.height, Rgb(self.color));
        Some(CaptureFrame::new(downscale(img, max_width, max_height)))
    }
}

// ========================= Screen =========================

#[derive(Clone, Debug)]
pub struct ScreenConfig {
    pub monitor: usize,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self { monitor: 1, max_width: 1280, max_height: 800 }
    }
}

pub struct Screen<S> {
    source: S,
    cache: ScreenshotCache,
    cfg: ScreenConfig,
}

impl<S: PixelSource> Screen<S> {
    pub fn new(source: S, cfg: ScreenConfig, cache: CacheConfig) -> Self {
        Self { source, cache: ScreenshotCache::new(cache), cfg }
    }

    pub async fn frame(&mut self, force_refresh: bool) -> Option<Arc<CaptureFrame>> {
        if let Some(frame) = self.cache.get_frame(force_refresh) {
            debug!(fingerprint = %frame.fingerprint, "reusing cached frame");
            return Some(frame);
        }
        let captured = self
            .source
            .capture(self.cfg.monitor, self.cfg.max_width, self.cfg.max_height)
            .await;
        let Some(frame) = captured else {
            warn!(monitor = self.cfg.monitor, "screen capture returned nothing");
            return None;
        };
        let frame = Arc::new(frame);
        let changed = self.cache.set_frame(frame.clone());
        debug!(changed, width = frame.width, height = frame.height, "captured frame");
        Some(frame)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
