//! Single-frame spoof likelihood from image statistics.
//!
//! A printed photo or a face replayed on a screen differs from a live face in
//! ways a single frame already reveals: print and screen surfaces are flatter
//! (low Laplacian variance), carry crisp artificial edges, have banded
//! histograms, and emissive displays add a pixel lattice and a blue cast.
//!
//! # Threat Coverage
//!
//! - **Scores low:** flat prints, uniform regions, heavily compressed replays.
//! - **Does not block alone:** high-quality prints under good light. The
//!   challenge state machine adds the motion evidence a photo cannot produce.

use image::{GrayImage, RgbImage};
use num_complex::Complex32;
use rustfft::FftPlanner;
use serde::Serialize;

use crate::config::SpoofConfig;

const TEXTURE_WEIGHT: f32 = 0.5;
const EDGE_WEIGHT: f32 = 0.3;
const ENTROPY_WEIGHT: f32 = 0.2;

const GRID_WEIGHT: f32 = 0.6;
const COLOR_WEIGHT: f32 = 0.4;
/// Spectrum percentile above which a magnitude counts as a peak.
const PEAK_PERCENTILE: f32 = 99.5;
const PEAK_NORMALIZER: f32 = 50.0;
/// Blue/red mean difference at which colour balance scores zero.
const COLOR_NORMALIZER: f32 = 50.0;

/// Per-signal components of a spoof score, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SpoofBreakdown {
    pub texture: f32,
    pub edge: f32,
    pub entropy: f32,
    pub score: f32,
}

/// Scores one cropped face region; higher means more likely live.
pub trait SpoofScorer {
    fn score(&self, region: &RgbImage) -> f32;
}

/// Default blend of texture, edge density and tonal entropy.
#[derive(Debug, Clone, Default)]
pub struct TextureSpoofScorer {
    config: SpoofConfig,
}

impl TextureSpoofScorer {
    pub fn new(config: SpoofConfig) -> Self {
        Self { config }
    }

    pub fn breakdown(&self, region: &RgbImage) -> SpoofBreakdown {
        spoof_breakdown(region, &self.config)
    }
}

impl SpoofScorer for TextureSpoofScorer {
    fn score(&self, region: &RgbImage) -> f32 {
        self.breakdown(region).score
    }
}

/// Texture blend averaged with the screen-artifact detector.
#[derive(Debug, Clone, Default)]
pub struct StrictSpoofScorer {
    inner: TextureSpoofScorer,
}

impl StrictSpoofScorer {
    pub fn new(config: SpoofConfig) -> Self {
        Self {
            inner: TextureSpoofScorer::new(config),
        }
    }
}

impl SpoofScorer for StrictSpoofScorer {
    fn score(&self, region: &RgbImage) -> f32 {
        let texture = self.inner.score(region);
        if texture == 0.0 {
            return 0.0;
        }
        (texture + screen_artifact_score(region)) / 2.0
    }
}

/// Build the scorer selected by `config.strict`.
pub fn scorer_from_config(config: &SpoofConfig) -> Box<dyn SpoofScorer + Send> {
    if config.strict {
        Box::new(StrictSpoofScorer::new(config.clone()))
    } else {
        Box::new(TextureSpoofScorer::new(config.clone()))
    }
}

/// Spoof score with default tuning.
pub fn spoof_score(region: &RgbImage) -> f32 {
    spoof_breakdown(region, &SpoofConfig::default()).score
}

/// Compute all three signals and their weighted blend.
///
/// An empty region, or one with a single uniform intensity, carries no live
/// evidence at all and scores `0.0` across the board.
pub fn spoof_breakdown(region: &RgbImage, config: &SpoofConfig) -> SpoofBreakdown {
    if region.width() == 0 || region.height() == 0 {
        return SpoofBreakdown::default();
    }

    let gray = image::imageops::grayscale(region);
    if is_uniform(&gray) {
        return SpoofBreakdown::default();
    }

    let texture = (laplacian_variance(&gray) / config.texture_divisor).min(1.0) as f32;

    let density = canny_edge_density(&gray, config.canny_low, config.canny_high);
    let edge = 1.0 - (density * config.edge_density_gain).min(1.0);

    let entropy = (histogram_entropy(&gray) / 8.0).min(1.0);

    let score = texture * TEXTURE_WEIGHT + edge * EDGE_WEIGHT + entropy * ENTROPY_WEIGHT;
    SpoofBreakdown {
        texture,
        edge,
        entropy,
        score: score.clamp(0.0, 1.0),
    }
}

/// Screen-replay likelihood from the frequency spectrum and colour cast.
///
/// Not part of the default blend; [`StrictSpoofScorer`] folds it in.
/// Returns a score in `[0, 1]`, `0.0` for an empty region.
pub fn screen_artifact_score(region: &RgbImage) -> f32 {
    let (w, h) = (region.width() as usize, region.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }

    let gray = image::imageops::grayscale(region);
    let magnitudes = spectrum_magnitudes(&gray);
    let cutoff = percentile(&magnitudes, PEAK_PERCENTILE);
    let peaks = magnitudes.iter().filter(|&&m| m > cutoff).count();
    let grid = 1.0 - (peaks as f32 / PEAK_NORMALIZER).min(1.0);

    let (mut sum_r, mut sum_b) = (0f64, 0f64);
    for px in region.pixels() {
        sum_r += f64::from(px[0]);
        sum_b += f64::from(px[2]);
    }
    let n = (w * h) as f64;
    let cast = ((sum_b - sum_r) / n).abs() as f32;
    let color = 1.0 - (cast / COLOR_NORMALIZER).min(1.0);

    (grid * GRID_WEIGHT + color * COLOR_WEIGHT).clamp(0.0, 1.0)
}

fn is_uniform(gray: &GrayImage) -> bool {
    let mut pixels = gray.pixels();
    match pixels.next() {
        Some(first) => pixels.all(|p| p[0] == first[0]),
        None => true,
    }
}

/// Index into `0..n` with reflect-101 border handling (`dcb|abcd|cba`).
fn reflect101(i: i64, n: i64) -> u32 {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
    }
    i as u32
}

fn px(gray: &GrayImage, x: i64, y: i64) -> f64 {
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    f64::from(gray.get_pixel(reflect101(x, w), reflect101(y, h))[0])
}

/// Variance of the 3×3 Laplacian response over the whole region.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    let n = (w * h) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..h {
        for x in 0..w {
            let v = px(gray, x - 1, y) + px(gray, x + 1, y) + px(gray, x, y - 1)
                + px(gray, x, y + 1)
                - 4.0 * px(gray, x, y);
            sum += v;
            sum_sq += v * v;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Fraction of pixels marked as edges by a Canny detector.
///
/// Sobel 3×3 gradients, L1 magnitude, non-maximum suppression along the
/// quantised gradient direction, then hysteresis between `low` and `high`.
fn canny_edge_density(gray: &GrayImage, low: f32, high: f32) -> f32 {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut gx = vec![0f32; w * h];
    let mut gy = vec![0f32; w * h];
    let mut mag = vec![0f32; w * h];

    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let p = |dx: i64, dy: i64| px(gray, xi + dx, yi + dy) as f32;
            let sx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            let sy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            let i = y * w + x;
            gx[i] = sx;
            gy[i] = sy;
            mag[i] = sx.abs() + sy.abs();
        }
    }

    let at = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            0.0
        } else {
            mag[y as usize * w + x as usize]
        }
    };

    // tan(22.5°) and tan(67.5°)
    const TAN_22_5: f32 = 0.414_213_57;
    const TAN_67_5: f32 = 2.414_213_6;

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        None,
        Weak,
        Strong,
    }
    let mut marks = vec![Mark::None; w * h];
    let mut stack = Vec::new();

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let m = mag[i];
            if m <= low {
                continue;
            }
            let (ax, ay) = (gx[i].abs(), gy[i].abs());
            let (xi, yi) = (x as i64, y as i64);
            let (n1, n2) = if ay <= ax * TAN_22_5 {
                (at(xi - 1, yi), at(xi + 1, yi))
            } else if ay >= ax * TAN_67_5 {
                (at(xi, yi - 1), at(xi, yi + 1))
            } else if gx[i] * gy[i] > 0.0 {
                (at(xi - 1, yi - 1), at(xi + 1, yi + 1))
            } else {
                (at(xi + 1, yi - 1), at(xi - 1, yi + 1))
            };
            if m > n1 && m >= n2 {
                if m > high {
                    marks[i] = Mark::Strong;
                    stack.push((x, y));
                } else {
                    marks[i] = Mark::Weak;
                }
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if marks[j] == Mark::Weak {
                    marks[j] = Mark::Strong;
                    stack.push((nx as usize, ny as usize));
                }
            }
        }
    }

    let edges = marks.iter().filter(|&&m| m == Mark::Strong).count();
    edges as f32 / (w * h) as f32
}

/// Shannon entropy (bits) of the 256-bin intensity histogram.
fn histogram_entropy(gray: &GrayImage) -> f32 {
    let mut hist = [0u32; 256];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total = f64::from(gray.width()) * f64::from(gray.height());
    let entropy: f64 = hist
        .iter()
        .map(|&count| {
            let p = f64::from(count) / total;
            -p * (p + 1e-7).log2()
        })
        .sum();
    entropy as f32
}

/// Magnitudes of the 2D DFT, computed as row FFTs followed by column FFTs.
fn spectrum_magnitudes(gray: &GrayImage) -> Vec<f32> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut rows: Vec<Complex32> = gray
        .pixels()
        .map(|p| Complex32::new(f32::from(p[0]), 0.0))
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let row_fft = planner.plan_fft_forward(w);
    for row in rows.chunks_exact_mut(w) {
        row_fft.process(row);
    }

    let mut cols = vec![Complex32::default(); w * h];
    for y in 0..h {
        for x in 0..w {
            cols[x * h + y] = rows[y * w + x];
        }
    }
    let col_fft = planner.plan_fft_forward(h);
    for col in cols.chunks_exact_mut(h) {
        col_fft.process(col);
    }

    cols.iter().map(|c| c.norm()).collect()
}

/// Linear-interpolated percentile (`q` in 0..=100).
fn percentile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f32)
}
