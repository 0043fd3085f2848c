use crate::screen::CaptureFrame;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// side of the hashing grid
const GRID: u32 = 32;

const STATS_EVERY: u64 = 100;

// ========================= Fingerprint =========================

/// Perceptual hash of a frame: equal for pixel-identical frames, different
/// (with high probability) when the visible layout changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Downsample to a 32x32 grayscale grid, set one bit per cell brighter than
/// the mean, and hash the bit pattern.
pub fn fingerprint(image: &RgbImage) -> Fingerprint {
    let mut bits = [0u8; (GRID * GRID / 8) as usize];
    if image.width() > 0 && image.height() > 0 {
        let small = imageops::resize(image, GRID, GRID, FilterType::Triangle);
        let luma = imageops::grayscale(&small);
        let total: u64 = luma.pixels().map(|p| p[0] as u64).sum();
        let mean = total as f64 / (GRID * GRID) as f64;
        for (i, p) in luma.pixels().enumerate() {
            if p[0] as f64 > mean {
                bits[i / 8] |= 1 << (7 - i % 8);
            }
        }
    }
    let digest = Sha256::digest(bits);
    Fingerprint(hex::encode(&digest[..8]))
}

// ========================= Adaptive Cache =========================

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub floor: Duration,
    pub ceiling: Duration,
    pub growth: f64,
    /// Unchanged captures tolerated before the timeout starts growing.
    pub threshold: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(500),
            ceiling: Duration::from_secs(2),
            growth: 1.2,
            threshold: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub timeout_ms: u128,
    pub unchanged_streak: u32,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Keeps the last captured frame and decides whether it is still fresh enough
/// to hand out again. The freshness window widens while consecutive captures
/// look the same and collapses to the floor as soon as anything changes.
pub struct ScreenshotCache {
    cfg: CacheConfig,
    frame: Option<Arc<CaptureFrame>>,
    stored_at: Option<Instant>,
    last_fingerprint: Option<Fingerprint>,
    timeout: Duration,
    unchanged_streak: u32,
    hits: u64,
    misses: u64,
}

impl Default for ScreenshotCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ScreenshotCache {
    pub fn new(mut cfg: CacheConfig) -> Self {
        if cfg.ceiling < cfg.floor {
            cfg.ceiling = cfg.floor;
        }
        if !(cfg.growth >= 1.0) {
            cfg.growth = 1.0;
        }
        let timeout = cfg.floor;
        Self {
            cfg,
            frame: None,
            stored_at: None,
            last_fingerprint: None,
            timeout,
            unchanged_streak: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get_frame(&mut self, force_refresh: bool) -> Option<Arc<CaptureFrame>> {
        let fresh = match (&self.frame, self.stored_at) {
            (Some(frame), Some(at)) if !force_refresh && at.elapsed() < self.timeout => {
                Some(frame.clone())
            }
            _ => None,
        };
        if fresh.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }

        let lookups = self.hits + self.misses;
        if lookups % STATS_EVERY == 0 {
            let stats = self.stats();
            info!(
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = format!("{:.1}%", stats.hit_rate() * 100.0),
                timeout_ms = stats.timeout_ms,
                "screenshot cache stats"
            );
        }
        fresh
    }

    pub fn set_frame(&mut self, frame: Arc<CaptureFrame>) -> bool {
        let changed = self.last_fingerprint.as_ref() != Some(&frame.fingerprint);
        if changed {
            self.unchanged_streak = 0;
            self.timeout = self.cfg.floor;
            debug!(fingerprint = %frame.fingerprint, "screen content changed");
        } else {
            self.unchanged_streak = self.unchanged_streak.saturating_add(1);
            if self.unchanged_streak > self.cfg.threshold {
                // out-of-range products clamp to the ceiling
                self.timeout = Duration::try_from_secs_f64(self.timeout.as_secs_f64() * self.cfg.growth)
                    .map(|grown| grown.min(self.cfg.ceiling))
                    .unwrap_or(self.cfg.ceiling);
                debug!(timeout_ms = self.timeout.as_millis(), "screen static, cache timeout raised");
            }
        }
        self.last_fingerprint = Some(frame.fingerprint.clone());
        self.frame = Some(frame);
        self.stored_at = Some(Instant::now());
        changed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            timeout_ms: self.timeout.as_millis(),
            unchanged_streak: self.unchanged_streak,
        }
    }

    // hit/miss counters survive a clear
    pub fn clear(&mut self) {
        self.frame = None;
        self.stored_at = None;
        self.last_fingerprint = None;
        self.unchanged_streak = 0;
        self.timeout = self.cfg.floor;
        info!("screenshot cache cleared");
    }
}
