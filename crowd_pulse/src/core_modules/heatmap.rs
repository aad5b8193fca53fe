// THEORY:
// The heatmap generator turns a frame's detections into a coarse density surface.
// It owns no state between frames; every call builds a fresh grid.
//
// Key architectural principles:
// 1.  **Gridding**: each detection is dropped into one grid cell. In frame mode
//     the grid follows the image at a fixed cell size and each person weighs 1.
//     In zone mode the grid has a fixed N x N resolution regardless of the image,
//     and each person weighs by how much of the frame their box covers.
// 2.  **Smoothing**: a separable gaussian (kernel radius `floor(4 sigma + 0.5)`,
//     reflect boundary) spreads each point so neighbouring people merge into one
//     warm area instead of isolated spikes.
// 3.  **Hotspots**: every cell strictly above a fraction of the peak is a
//     hotspot. Hotspots are tiered against each other by intensity quantiles, so
//     the tier says "how hot relative to the rest of this frame".
// 4.  **Never absent**: an empty detection set still yields a well-formed,
//     all-zero surface.

use crate::config::HeatmapConfig;
use crate::core_modules::density::{DensityTier, OccupancyTierPolicy, occupancy_percentage};
use crate::core_modules::detection::Detection;
use chrono::{DateTime, Utc};
use ndarray::{Array2, Axis};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeatmapMode {
    /// Grid follows the frame at `cell_size` pixels per cell.
    Frame,
    /// Fixed-resolution grid with occupancy against a zone's capacity.
    Zone { capacity: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    /// Pixel position of the cell origin.
    pub center: [u32; 2],
    /// `[row, col]` of the cell.
    pub grid_cell: [usize; 2],
    pub intensity: f32,
    /// Raw number of detection centers that fell in this cell.
    pub people_in_area: u32,
    pub density_tier: DensityTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapData {
    #[serde(skip)]
    pub grid: Array2<f32>,
    pub grid_shape: [usize; 2],
    pub hotspots: Vec<Hotspot>,
    pub total_people: usize,
    pub max_density: f32,
    pub avg_density: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_tier: Option<DensityTier>,
    #[serde(serialize_with = "crate::messages::serialize_utc")]
    pub generated_at: DateTime<Utc>,
}

pub struct HeatmapGenerator {
    config: HeatmapConfig,
    occupancy: OccupancyTierPolicy,
}

impl HeatmapGenerator {
    pub fn new(config: HeatmapConfig, occupancy: OccupancyTierPolicy) -> Self {
        Self { config, occupancy }
    }

    pub fn generate(
        &self,
        detections: &[Detection],
        frame_width: u32,
        frame_height: u32,
        mode: HeatmapMode,
        now: DateTime<Utc>,
    ) -> HeatmapData {
        // Stage 1: choose the grid geometry and each person's weight.
        let (rows, cols, cell_w, cell_h, sigma, threshold) = match mode {
            HeatmapMode::Frame => {
                let cell = self.config.cell_size;
                (
                    (frame_height / cell) as usize,
                    (frame_width / cell) as usize,
                    cell as f32,
                    cell as f32,
                    self.config.frame_sigma,
                    self.config.frame_hotspot_threshold,
                )
            }
            HeatmapMode::Zone { .. } => {
                let n = self.config.zone_resolution;
                (
                    n,
                    n,
                    frame_width as f32 / n as f32,
                    frame_height as f32 / n as f32,
                    self.config.zone_sigma,
                    self.config.zone_hotspot_threshold,
                )
            }
        };
        let frame_area = (frame_width as f32 * frame_height as f32).max(1.0);

        // Stage 2: drop every detection center into its cell.
        let mut raw = Array2::<f32>::zeros((rows, cols));
        let mut counts = Array2::<u32>::zeros((rows, cols));
        for d in detections {
            let Some((r, c)) = cell_of(d.center, cell_w, cell_h, rows, cols) else {
                continue;
            };
            let weight = match mode {
                HeatmapMode::Frame => 1.0,
                HeatmapMode::Zone { .. } => d.confidence * d.area / frame_area,
            };
            raw[[r, c]] += weight;
            counts[[r, c]] += 1;
        }

        // Stage 3: smooth and summarise.
        let grid = gaussian_smooth(&raw, sigma);
        let max_density = grid.iter().copied().fold(0.0f32, f32::max);
        let avg_density = if grid.is_empty() { 0.0 } else { grid.sum() / grid.len() as f32 };

        // Stage 4: extract hotspots above the relative threshold.
        let mut hotspots = Vec::new();
        if max_density > 0.0 {
            let cutoff = max_density * threshold;
            for ((r, c), &intensity) in grid.indexed_iter() {
                if intensity <= cutoff {
                    continue;
                }
                let radius = match mode {
                    HeatmapMode::Frame => None,
                    HeatmapMode::Zone { .. } => {
                        let (lo, hi) = (self.config.min_hotspot_radius, self.config.max_hotspot_radius);
                        Some(lo + (hi - lo) * (intensity / max_density))
                    }
                };
                hotspots.push(Hotspot {
                    center: [(c as f32 * cell_w) as u32, (r as f32 * cell_h) as u32],
                    grid_cell: [r, c],
                    intensity,
                    people_in_area: counts[[r, c]],
                    density_tier: DensityTier::Low,
                    radius,
                });
            }
            assign_quantile_tiers(&mut hotspots);
        }

        let (occupancy_percentage, occupancy_tier) = match mode {
            HeatmapMode::Frame => (None, None),
            HeatmapMode::Zone { capacity } => {
                let pct = occupancy_percentage(detections.len(), capacity);
                (Some(pct), Some(self.occupancy.classify(pct)))
            }
        };

        HeatmapData {
            grid_shape: [rows, cols],
            grid,
            hotspots,
            total_people: detections.len(),
            max_density,
            avg_density,
            occupancy_percentage,
            occupancy_tier,
            generated_at: now,
        }
    }
}

fn cell_of(center: [f32; 2], cell_w: f32, cell_h: f32, rows: usize, cols: usize) -> Option<(usize, usize)> {
    if rows == 0 || cols == 0 || cell_w <= 0.0 || cell_h <= 0.0 {
        return None;
    }
    let c = (center[0] / cell_w).floor();
    let r = (center[1] / cell_h).floor();
    if c < 0.0 || r < 0.0 {
        return None;
    }
    let (r, c) = (r as usize, c as usize);
    (r < rows && c < cols).then_some((r, c))
}

/// Tier each hotspot against the intensity quartiles of all hotspots.
fn assign_quantile_tiers(hotspots: &mut [Hotspot]) {
    let mut sorted: Vec<f32> = hotspots.iter().map(|h| h.intensity).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let (q25, q50, q75) = (quantile(&sorted, 0.25), quantile(&sorted, 0.5), quantile(&sorted, 0.75));
    for h in hotspots.iter_mut() {
        h.density_tier = if h.intensity >= q75 {
            DensityTier::Critical
        } else if h.intensity >= q50 {
            DensityTier::High
        } else if h.intensity >= q25 {
            DensityTier::Medium
        } else {
            DensityTier::Low
        };
    }
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f32], q: f32) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q * (n - 1) as f32;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = pos - lo as f32;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / denom).exp()
        })
        .collect();
    let total: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= total;
    }
    kernel
}

/// Reflect index into `0..n` (`d c b a | a b c d | d c b a`).
fn reflect(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period) as usize;
    if m < n { m } else { 2 * n - 1 - m }
}

fn convolve_axis(input: &Array2<f32>, kernel: &[f32], axis: Axis) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(input.raw_dim());
    let radius = (kernel.len() / 2) as isize;
    let n = input.len_of(axis);
    for (lane_in, mut lane_out) in input.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        for i in 0..n {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let src = reflect(i as isize + k as isize - radius, n);
                acc += w * lane_in[src];
            }
            lane_out[i] = acc;
        }
    }
    out
}

/// Separable gaussian blur with reflect boundary handling.
pub fn gaussian_smooth(grid: &Array2<f32>, sigma: f32) -> Array2<f32> {
    if grid.is_empty() {
        return grid.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let along_cols = convolve_axis(grid, &kernel, Axis(1));
    convolve_axis(&along_cols, &kernel, Axis(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::person;

    fn generator() -> HeatmapGenerator {
        HeatmapGenerator::new(HeatmapConfig::default(), OccupancyTierPolicy::default())
    }

    #[test]
    fn empty_detections_give_an_empty_surface() {
        let data = generator().generate(&[], 640, 480, HeatmapMode::Frame, Utc::now());
        assert_eq!(data.grid_shape, [120, 160]);
        assert!(data.hotspots.is_empty());
        assert_eq!(data.max_density, 0.0);
        assert_eq!(data.avg_density, 0.0);
        assert_eq!(data.total_people, 0);
        assert!(data.occupancy_percentage.is_none());
    }

    #[test]
    fn empty_zone_surface_reports_zero_occupancy() {
        let data = generator().generate(&[], 640, 480, HeatmapMode::Zone { capacity: 50 }, Utc::now());
        assert_eq!(data.grid_shape, [50, 50]);
        assert_eq!(data.occupancy_percentage, Some(0.0));
        assert_eq!(data.occupancy_tier, Some(DensityTier::None));
    }

    #[test]
    fn single_person_peaks_at_their_cell() {
        // center (42, 82) -> row 20, col 10
        let one = person(32.0, 62.0, 52.0, 102.0, 0.9);
        let data = generator().generate(&[one], 640, 480, HeatmapMode::Frame, Utc::now());
        let peak = data
            .hotspots
            .iter()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
            .unwrap();
        assert_eq!(peak.grid_cell, [20, 10]);
        assert_eq!(peak.center, [40, 80]);
        assert_eq!(peak.people_in_area, 1);
        assert_eq!(peak.density_tier, DensityTier::Critical);
        assert!((data.max_density - peak.intensity).abs() < f32::EPSILON);
        // mass is preserved away from the borders
        assert!((data.grid.sum() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn hotspots_are_strictly_above_half_peak() {
        let people = vec![person(0.0, 0.0, 20.0, 40.0, 0.9), person(300.0, 200.0, 320.0, 240.0, 0.9)];
        let data = generator().generate(&people, 640, 480, HeatmapMode::Frame, Utc::now());
        let cutoff = data.max_density * 0.5;
        assert!(!data.hotspots.is_empty());
        assert!(data.hotspots.iter().all(|h| h.intensity > cutoff));
        assert_eq!(data.total_people, 2);
    }

    #[test]
    fn zone_mode_scales_radius_and_occupancy() {
        let people: Vec<_> = (0..95)
            .map(|i| {
                let x = (i % 19) as f32 * 30.0;
                let y = (i / 19) as f32 * 80.0;
                person(x, y, x + 20.0, y + 60.0, 0.8)
            })
            .collect();
        let data = generator().generate(&people, 640, 480, HeatmapMode::Zone { capacity: 100 }, Utc::now());
        assert_eq!(data.occupancy_percentage, Some(95.0));
        assert_eq!(data.occupancy_tier, Some(DensityTier::Critical));
        for h in &data.hotspots {
            let r = h.radius.unwrap();
            assert!((10.0..=50.0).contains(&r));
        }
    }

    #[test]
    fn reflect_boundary_matches_half_sample_symmetry() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(2, 5), 2);
    }

    #[test]
    fn kernel_radius_and_normalisation() {
        assert_eq!(gaussian_kernel(2.0).len(), 2 * 8 + 1);
        assert_eq!(gaussian_kernel(1.5).len(), 2 * 6 + 1);
        let total: f32 = gaussian_kernel(1.5).iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&v, 0.5), 3.0);
        assert_eq!(quantile(&v, 0.25), 2.0);
        assert_eq!(quantile(&[7.0], 0.75), 7.0);
    }

    #[test]
    fn grid_is_not_serialized_but_shape_is() {
        let data = generator().generate(&[], 64, 32, HeatmapMode::Frame, Utc::now());
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("grid").is_none());
        assert_eq!(json["grid_shape"], serde_json::json!([8, 16]));
    }
}
