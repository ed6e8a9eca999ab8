//! Challenge rendering.
//!
//! [`Renderer`] is the seam to whatever produces the challenge image and its
//! solution mask. [`ShapeRenderer`] is the built-in implementation: a scene
//! of flat shapes with one target, plus a reference panel showing the target
//! alone on a random side. The mask marks exactly the target's pixels in the
//! scene as clickable.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use clickgate_common::constants::extensions;
use clickgate_common::{CaptchaError, MaskError};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{
    Canvas, draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_polygon_mut,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use rand::Rng;
use thiserror::Error;

use crate::config::RendererConfig;
use crate::mask::{PixelGrid, encode};

/// What a renderer produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedArtifact {
    /// Declared width of both image and mask
    pub width: u32,
    pub height: u32,
    /// Unix timestamp
    pub generated_at: i64,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("mask encoding failed: {0}")]
    Mask(#[from] MaskError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Scene(String),
}

impl From<RenderError> for CaptchaError {
    fn from(e: RenderError) -> Self {
        CaptchaError::Render(e.to_string())
    }
}

/// Produces one challenge image and its binary solution mask.
///
/// Implementations block; callers run them on the blocking pool.
pub trait Renderer: Send + Sync {
    fn generate(&self, image_path: &Path, mask_path: &Path) -> Result<RenderedArtifact, RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShapeKind {
    Circle,
    Square,
    Triangle,
    Diamond,
}

const SHAPE_KINDS: [ShapeKind; 4] = [
    ShapeKind::Circle,
    ShapeKind::Square,
    ShapeKind::Triangle,
    ShapeKind::Diamond,
];

#[derive(Debug, Clone, Copy)]
struct Shape {
    kind: ShapeKind,
    cx: i32,
    cy: i32,
    /// Bounding box side
    size: i32,
}

impl Shape {
    fn random(rng: &mut impl Rng, kind: ShapeKind, width: u32, height: u32) -> Self {
        let short = width.min(height) as i32;
        let size = rng.random_range(short / 6..=short / 3);
        let half = size / 2 + 1;
        Self {
            kind,
            cx: rng.random_range(half..(width as i32 - half).max(half + 1)),
            cy: rng.random_range(half..(height as i32 - half).max(half + 1)),
            size,
        }
    }

    fn draw<C: Canvas>(&self, canvas: &mut C, dx: i32, color: C::Pixel) {
        let (cx, cy, half) = (self.cx + dx, self.cy, self.size / 2);
        match self.kind {
            ShapeKind::Circle => draw_filled_circle_mut(canvas, (cx, cy), half, color),
            ShapeKind::Square => draw_filled_rect_mut(
                canvas,
                Rect::at(cx - half, cy - half).of_size(self.size as u32, self.size as u32),
                color,
            ),
            ShapeKind::Triangle => draw_polygon_mut(
                canvas,
                &[
                    Point::new(cx, cy - half),
                    Point::new(cx + half, cy + half),
                    Point::new(cx - half, cy + half),
                ],
                color,
            ),
            ShapeKind::Diamond => draw_polygon_mut(
                canvas,
                &[
                    Point::new(cx, cy - half),
                    Point::new(cx + half, cy),
                    Point::new(cx, cy + half),
                    Point::new(cx - half, cy),
                ],
                color,
            ),
        }
    }
}

fn random_color(rng: &mut impl Rng, low: u8, high: u8) -> Rgb<u8> {
    Rgb([
        rng.random_range(low..=high),
        rng.random_range(low..=high),
        rng.random_range(low..=high),
    ])
}

/// Built-in flat-shape renderer
pub struct ShapeRenderer {
    config: RendererConfig,
}

impl ShapeRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    /// Draw the challenge and its mask in memory
    fn render(&self) -> Result<(RgbImage, GrayImage), RenderError> {
        let (width, height) = (self.config.width, self.config.height);
        if width < 32 || height < 32 {
            return Err(RenderError::Scene(format!("scene {width}x{height} is too small")));
        }
        let mut rng = rand::rng();

        let background = random_color(&mut rng, 10, 60);
        let target_kind = SHAPE_KINDS[rng.random_range(0..SHAPE_KINDS.len())];
        let target = Shape::random(&mut rng, target_kind, width, height);
        let target_color = random_color(&mut rng, 120, 255);

        // Scene: noise, distractors of other kinds, target on top
        let mut scene = RgbImage::from_pixel(width, height, background);
        for _ in 0..self.config.distractors * 2 {
            let start = (rng.random_range(0.0..width as f32), rng.random_range(0.0..height as f32));
            let end = (rng.random_range(0.0..width as f32), rng.random_range(0.0..height as f32));
            let color = random_color(&mut rng, 60, 200);
            draw_line_segment_mut(&mut scene, start, end, color);
        }
        for _ in 0..self.config.distractors {
            let kind = loop {
                let kind = SHAPE_KINDS[rng.random_range(0..SHAPE_KINDS.len())];
                if kind != target_kind {
                    break kind;
                }
            };
            let color = random_color(&mut rng, 80, 255);
            Shape::random(&mut rng, kind, width, height).draw(&mut scene, 0, color);
        }
        target.draw(&mut scene, 0, target_color);

        // Reference panel: the target alone, centered
        let mut panel = RgbImage::from_pixel(width, height, background);
        let centered = Shape {
            cx: width as i32 / 2,
            cy: height as i32 / 2,
            ..target
        };
        centered.draw(&mut panel, 0, target_color);

        let reference_on_left = rng.random_bool(0.5);
        let (panel_x, scene_x) = if reference_on_left { (0, width) } else { (width, 0) };

        let mut challenge = RgbImage::new(width * 2, height);
        image::imageops::replace(&mut challenge, &panel, panel_x as i64, 0);
        image::imageops::replace(&mut challenge, &scene, scene_x as i64, 0);

        let mut mask = GrayImage::new(width * 2, height);
        target.draw(&mut mask, scene_x as i32, Luma([255]));

        Ok((challenge, mask))
    }
}

impl Renderer for ShapeRenderer {
    fn generate(&self, image_path: &Path, mask_path: &Path) -> Result<RenderedArtifact, RenderError> {
        let (challenge, mask) = self.render()?;

        let mut writer = BufWriter::new(File::create(image_path)?);
        JpegEncoder::new_with_quality(&mut writer, self.config.jpeg_quality).encode_image(&challenge)?;
        writer.flush()?;

        encode(&PixelGrid::from_luma(&mask)).write_to(mask_path)?;
        if self.config.debug_png {
            mask.save(mask_path.with_extension(extensions::DEBUG))?;
        }

        Ok(RenderedArtifact {
            width: challenge.width(),
            height: challenge.height(),
            generated_at: chrono::Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic renderer for lifecycle tests.

    use super::*;
    use clickgate_common::Symbol;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Writes a fixed mask: clickable left half, background right half
    pub struct GridRenderer {
        pub calls: AtomicUsize,
        /// Fail every call once this many calls succeeded
        pub fail_after: AtomicU64,
        pub debug_png: bool,
    }

    impl GridRenderer {
        pub const WIDTH: u32 = 8;
        pub const HEIGHT: u32 = 4;

        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: AtomicU64::new(u64::MAX),
                debug_png: false,
            }
        }

        pub fn failing_after(successes: u64) -> Self {
            let renderer = Self::new();
            renderer.fail_after.store(successes, Ordering::SeqCst);
            renderer
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Renderer for GridRenderer {
        fn generate(&self, image_path: &Path, mask_path: &Path) -> Result<RenderedArtifact, RenderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            if call >= self.fail_after.load(Ordering::SeqCst) {
                return Err(RenderError::Scene("renderer offline".into()));
            }

            std::fs::write(image_path, b"challenge")?;
            let grid = PixelGrid::from_fn(Self::HEIGHT, Self::WIDTH, |x, _| {
                if x < Self::WIDTH / 2 { Symbol::White } else { Symbol::Black }
            });
            encode(&grid).write_to(mask_path)?;
            if self.debug_png {
                std::fs::write(mask_path.with_extension(extensions::DEBUG), b"png")?;
            }

            Ok(RenderedArtifact {
                width: Self::WIDTH,
                height: Self::HEIGHT,
                generated_at: 0,
            })
        }
    }
}
