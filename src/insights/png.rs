//! PNG charts of cache statistics.

use super::{CacheInsight, CacheInsightRenderer, HISTOGRAM_BINS};
use anyhow::{Context, Result};
use candle_core::Tensor;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const STD_FIGURE: &str = "cache_std.png";
pub const DISTRIBUTION_FIGURE: &str = "cache_distribution.png";

const WIDTH: u32 = 1000;
const STD_HEIGHT: u32 = 600;
const SUBPLOT_HEIGHT: u32 = 200;
const MARGIN: u32 = 40;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([64, 64, 64]);
const PALETTE: [Rgb<u8>; 6] = [
    Rgb([31, 119, 180]),
    Rgb([255, 127, 14]),
    Rgb([44, 160, 44]),
    Rgb([214, 39, 40]),
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
];

/// Writes `cache_std.png` and `cache_distribution.png` into `out_dir` and
/// prints one summary line per cache.
pub struct PngInsightRenderer {
    out_dir: PathBuf,
}

impl PngInsightRenderer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

/// Plot area inside `MARGIN` of a `WIDTH` x `height` panel starting at `top`.
struct Frame {
    left: f32,
    top: f32,
    width: f32,
    height: f32,
}

impl Frame {
    fn new(top: u32, height: u32) -> Self {
        Self {
            left: MARGIN as f32,
            top: (top + MARGIN / 2) as f32,
            width: (WIDTH - 2 * MARGIN) as f32,
            height: (height - MARGIN) as f32,
        }
    }

    fn bottom(&self) -> f32 {
        self.top + self.height
    }

    fn draw_axes(&self, img: &mut RgbImage) {
        let rect = Rect::at(self.left as i32, self.top as i32)
            .of_size(self.width as u32, self.height as u32);
        draw_hollow_rect_mut(img, rect, AXIS);
    }
}

fn draw_std_chart(insights: &[CacheInsight], path: &Path) -> Result<()> {
    let mut img = RgbImage::from_pixel(WIDTH, STD_HEIGHT, WHITE);
    let frame = Frame::new(0, STD_HEIGHT);
    frame.draw_axes(&mut img);

    let n_tokens = insights.iter().map(|i| i.token_std.len()).max().unwrap_or(0);
    let y_max = insights
        .iter()
        .flat_map(|i| i.token_std.iter().copied())
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max);
    if n_tokens >= 2 && y_max > 0.0 {
        let x_step = frame.width / (n_tokens - 1) as f32;
        for (series, insight) in insights.iter().enumerate() {
            let color = PALETTE[series % PALETTE.len()];
            let points: Vec<(f32, f32)> = insight
                .token_std
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .map(|(t, &v)| {
                    let x = frame.left + t as f32 * x_step;
                    let y = frame.bottom() - (v / y_max) as f32 * frame.height;
                    (x, y)
                })
                .collect();
            for pair in points.windows(2) {
                draw_line_segment_mut(&mut img, pair[0], pair[1], color);
            }
        }
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn draw_distribution_chart(insights: &[CacheInsight], path: &Path) -> Result<()> {
    let height = SUBPLOT_HEIGHT * insights.len().max(1) as u32;
    let mut img = RgbImage::from_pixel(WIDTH, height, WHITE);
    for (idx, insight) in insights.iter().enumerate() {
        let frame = Frame::new(idx as u32 * SUBPLOT_HEIGHT, SUBPLOT_HEIGHT);
        frame.draw_axes(&mut img);
        let counts = insight.histogram();
        let peak = counts.iter().copied().max().unwrap_or(0);
        if peak == 0 {
            continue;
        }
        let color = PALETTE[idx % PALETTE.len()];
        let bin_width = frame.width / HISTOGRAM_BINS as f32;
        for (bin, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let x = frame.left + (bin as f32 + 0.5) * bin_width;
            let y = frame.bottom() - count as f32 / peak as f32 * frame.height;
            draw_line_segment_mut(&mut img, (x, frame.bottom()), (x, y), color);
        }
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

impl CacheInsightRenderer for PngInsightRenderer {
    fn render(&self, caches: &[(&str, &Tensor)]) -> Result<()> {
        let insights = caches
            .iter()
            .map(|(label, cache)| CacheInsight::compute(label, cache))
            .collect::<Result<Vec<_>>>()?;

        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("creating {}", self.out_dir.display()))?;
        let std_path = self.out_dir.join(STD_FIGURE);
        draw_std_chart(&insights, &std_path)?;

        println!("(min/max/std/mean)");
        for insight in &insights {
            println!("{}", insight.summary_line());
        }
        let dist_path = self.out_dir.join(DISTRIBUTION_FIGURE);
        draw_distribution_chart(&insights, &dist_path)?;

        info!(
            std = %std_path.display(),
            distribution = %dist_path.display(),
            "wrote cache insight figures"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_render_writes_both_figures() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = PngInsightRenderer::new(dir.path().join("figs"));
        let data: Vec<f32> = (0..2 * 2 * 5 * 4).map(|i| (i as f32 * 0.3).sin()).collect();
        let cache = Tensor::from_vec(data, (2, 1, 2, 5, 4), &Device::Cpu).unwrap();
        let scaled = (&cache * 0.9).unwrap();
        renderer
            .render(&[("Key cache", &cache), ("Quantized key cache", &scaled)])
            .unwrap();

        let std_img = image::open(renderer.out_dir().join(STD_FIGURE)).unwrap();
        assert_eq!((std_img.width(), std_img.height()), (WIDTH, STD_HEIGHT));
        let dist_img = image::open(renderer.out_dir().join(DISTRIBUTION_FIGURE)).unwrap();
        assert_eq!(dist_img.height(), 2 * SUBPLOT_HEIGHT);
    }
}
