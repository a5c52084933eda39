// Typesetting: composites manual text boxes and free-hand strokes onto a
// page. Shaping and glyph rasterization go through cosmic-text; the page
// keeps its source encoding (PNG stays PNG, WebP is re-encoded lossless,
// JPEG stays JPEG).

use cosmic_text::{
    fontdb, Attrs, Buffer, Color as CosmicColor, Family, FontSystem, Metrics, Shaping, SwashCache,
    Wrap,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_circle_mut;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{TypesetError, TypesetResult};
use crate::core::types::{
    is_cjk_text, Stroke, StrokeMode, TextAlign, TypesetOverrides, TypesetRegion, VerticalAlign,
};
use crate::utils::{encode_preserving_format, load_image_from_memory_async};

pub struct Typesetter {
    font_system: Arc<Mutex<FontSystem>>,
    swash_cache: Arc<Mutex<SwashCache>>,
}

impl Typesetter {
    /// Build a font system from the fonts directory only, skipping the
    /// system font scan.
    pub fn new(fonts_dir: &str) -> TypesetResult<Self> {
        let mut db = fontdb::Database::new();
        let mut loaded = 0usize;

        match std::fs::read_dir(fonts_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_font = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| matches!(e.to_lowercase().as_str(), "ttf" | "otf" | "ttc"))
                        .unwrap_or(false);
                    if !is_font {
                        continue;
                    }
                    match std::fs::read(&path) {
                        Ok(data) => {
                            db.load_font_data(data);
                            loaded += 1;
                            debug!(path = %path.display(), "font loaded");
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "font unreadable"),
                    }
                }
            }
            Err(e) => warn!(dir = fonts_dir, error = %e, "fonts directory unreadable"),
        }

        if loaded == 0 {
            warn!(dir = fonts_dir, "no fonts loaded, glyphs will not render");
        }
        info!(fonts = loaded, "typesetter initialized");

        let font_system = FontSystem::new_with_locale_and_db("en-US".to_string(), db);
        Ok(Self {
            font_system: Arc::new(Mutex::new(font_system)),
            swash_cache: Arc::new(Mutex::new(SwashCache::new())),
        })
    }

    fn family_of(region: &TypesetRegion) -> Family<'static> {
        match &region.font_family {
            Some(name) if !name.trim().is_empty() => {
                Family::Name(Box::leak(name.clone().into_boxed_str()))
            }
            _ => Family::SansSerif,
        }
    }

    /// Composite the overrides onto the page. Empty overrides leave the
    /// pixels untouched (the page is only re-encoded).
    #[instrument(skip(self, image_bytes, overrides), fields(
        regions = overrides.regions.len(),
        strokes = overrides.strokes.len(),
    ))]
    pub async fn render_page(
        &self,
        image_bytes: &[u8],
        overrides: &TypesetOverrides,
    ) -> TypesetResult<Vec<u8>> {
        let format = image::guess_format(image_bytes).unwrap_or(ImageFormat::Png);
        let page = load_image_from_memory_async(image_bytes).await?;

        if overrides.is_empty() {
            return Ok(encode_preserving_format(&page, format)?);
        }

        let mut canvas = page.to_rgba8();

        for stroke in &overrides.strokes {
            apply_stroke(&mut canvas, stroke)?;
        }

        for region in &overrides.regions {
            if region.user_text.trim().is_empty() {
                continue;
            }
            self.render_region(&mut canvas, region).await?;
        }

        Ok(encode_preserving_format(
            &DynamicImage::ImageRgba8(canvas),
            format,
        )?)
    }

    async fn render_region(
        &self,
        canvas: &mut RgbaImage,
        region: &TypesetRegion,
    ) -> TypesetResult<()> {
        let color = parse_hex_color(&region.color)?;
        let stroke_color = parse_hex_color(&region.stroke_color)?;
        let family = Self::family_of(region);
        let font_size = region.font_size.max(1) as f32;
        let line_step = font_size * region.line_height.max(0.5);

        if region.is_vertical {
            return self
                .render_vertical(canvas, region, family, font_size, line_step, color, stroke_color)
                .await;
        }

        let max_width = region.bbox.w.max(1) as f32;
        let lines = self
            .wrap_text(&region.user_text, family, font_size, line_step, max_width)
            .await;

        let total_height = lines.len() as f32 * line_step;
        let mut y = match region.vertical_align {
            VerticalAlign::Top => region.bbox.y as f32,
            VerticalAlign::Middle => {
                region.bbox.y as f32 + (region.bbox.h as f32 - total_height) / 2.0
            }
            VerticalAlign::Bottom => region.bbox.bottom() as f32 - total_height,
        };

        for line in &lines {
            let line_width = self
                .measure_line(line, family, font_size, line_step, region.letter_spacing)
                .await;
            let x = match region.align {
                TextAlign::Left => region.bbox.x as f32,
                TextAlign::Center => {
                    region.bbox.x as f32 + (region.bbox.w as f32 - line_width) / 2.0
                }
                TextAlign::Right => region.bbox.right() as f32 - line_width,
            };

            if region.letter_spacing != 0.0 {
                self.draw_spaced_line(
                    canvas,
                    line,
                    family,
                    font_size,
                    line_step,
                    region.letter_spacing,
                    color,
                    stroke_color,
                    region.stroke_width,
                    x,
                    y,
                )
                .await;
            } else {
                self.draw_text(
                    canvas,
                    line,
                    family,
                    font_size,
                    line_step,
                    color,
                    stroke_color,
                    region.stroke_width,
                    x.round() as i32,
                    y.round() as i32,
                )
                .await;
            }
            y += line_step;
        }
        Ok(())
    }

    /// Vertical layout stacks one character per line down the box, the way
    /// CJK dialogue is set in vertical bubbles.
    #[allow(clippy::too_many_arguments)]
    async fn render_vertical(
        &self,
        canvas: &mut RgbaImage,
        region: &TypesetRegion,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        color: Rgba<u8>,
        stroke_color: Rgba<u8>,
    ) -> TypesetResult<()> {
        let chars: Vec<String> = region
            .user_text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_string())
            .collect();
        if chars.is_empty() {
            return Ok(());
        }

        let step = line_step + region.letter_spacing;
        let total_height = chars.len() as f32 * step;
        let mut y = match region.vertical_align {
            VerticalAlign::Top => region.bbox.y as f32,
            VerticalAlign::Middle => {
                region.bbox.y as f32 + (region.bbox.h as f32 - total_height) / 2.0
            }
            VerticalAlign::Bottom => region.bbox.bottom() as f32 - total_height,
        };
        let center_x = region.bbox.x as f32 + region.bbox.w as f32 / 2.0;

        for ch in &chars {
            let w = self.measure_line(ch, family, font_size, line_step, 0.0).await;
            self.draw_text(
                canvas,
                ch,
                family,
                font_size,
                line_step,
                color,
                stroke_color,
                region.stroke_width,
                (center_x - w / 2.0).round() as i32,
                y.round() as i32,
            )
            .await;
            y += step;
        }
        Ok(())
    }

    /// Greedy word wrap against measured widths. Explicit newlines are kept;
    /// CJK text wraps per character since it carries no word gaps.
    async fn wrap_text(
        &self,
        text: &str,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        max_width: f32,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        for raw_line in text.lines() {
            let units: Vec<String> = if is_cjk_text(raw_line) {
                raw_line
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .map(|c| c.to_string())
                    .collect()
            } else {
                raw_line.split_whitespace().map(str::to_string).collect()
            };
            if units.is_empty() {
                lines.push(String::new());
                continue;
            }
            let joiner = if is_cjk_text(raw_line) { "" } else { " " };

            let mut current = String::new();
            for unit in units {
                let candidate = if current.is_empty() {
                    unit.clone()
                } else {
                    format!("{current}{joiner}{unit}")
                };
                let width = self
                    .measure_line(&candidate, family, font_size, line_step, 0.0)
                    .await;
                if width <= max_width || current.is_empty() {
                    current = candidate;
                } else {
                    lines.push(current);
                    current = unit;
                }
            }
            if !current.is_empty() {
                lines.push(current);
            }
        }
        lines
    }

    /// Shaped width of a single line, including letter spacing.
    async fn measure_line(
        &self,
        text: &str,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        letter_spacing: f32,
    ) -> f32 {
        if text.is_empty() {
            return 0.0;
        }
        let mut font_system = self.font_system.lock().await;
        let metrics = Metrics::new(font_size, line_step);
        let mut buffer = Buffer::new(&mut font_system, metrics);
        buffer.set_wrap(&mut font_system, Wrap::None);
        let attrs = Attrs::new().family(family);
        buffer.set_text(&mut font_system, text, attrs, Shaping::Advanced);
        buffer.shape_until_scroll(&mut font_system, false);

        let shaped = buffer
            .layout_runs()
            .map(|run| run.line_w)
            .fold(0.0f32, f32::max);
        let extra = letter_spacing * text.chars().count().saturating_sub(1) as f32;
        shaped + extra
    }

    /// Draw one line at a fixed position: stroke offsets first, fill on top.
    #[allow(clippy::too_many_arguments)]
    async fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        color: Rgba<u8>,
        stroke_color: Rgba<u8>,
        stroke_width: u32,
        x: i32,
        y: i32,
    ) {
        if stroke_width > 0 {
            let width = stroke_width as i32;
            let radius_sq = (width * width) as f32;
            for offset_y in -width..=width {
                for offset_x in -width..=width {
                    if offset_x == 0 && offset_y == 0 {
                        continue;
                    }
                    let distance_sq = (offset_x * offset_x + offset_y * offset_y) as f32;
                    if distance_sq <= radius_sq * 1.2 {
                        self.draw_text_once(
                            canvas,
                            text,
                            family,
                            font_size,
                            line_step,
                            stroke_color,
                            x + offset_x,
                            y + offset_y,
                        )
                        .await;
                    }
                }
            }
        }
        self.draw_text_once(canvas, text, family, font_size, line_step, color, x, y)
            .await;
    }

    /// Per-character drawing with an explicit advance, used when letter
    /// spacing is requested.
    #[allow(clippy::too_many_arguments)]
    async fn draw_spaced_line(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        letter_spacing: f32,
        color: Rgba<u8>,
        stroke_color: Rgba<u8>,
        stroke_width: u32,
        x: f32,
        y: f32,
    ) {
        let mut pen_x = x;
        for ch in text.chars() {
            let s = ch.to_string();
            let advance = self.measure_line(&s, family, font_size, line_step, 0.0).await;
            if !ch.is_whitespace() {
                self.draw_text(
                    canvas,
                    &s,
                    family,
                    font_size,
                    line_step,
                    color,
                    stroke_color,
                    stroke_width,
                    pen_x.round() as i32,
                    y.round() as i32,
                )
                .await;
            }
            pen_x += advance + letter_spacing;
        }
    }

    async fn draw_text_once(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        family: Family<'static>,
        font_size: f32,
        line_step: f32,
        color: Rgba<u8>,
        x: i32,
        y: i32,
    ) {
        let buffer = {
            let mut font_system = self.font_system.lock().await;
            let metrics = Metrics::new(font_size, line_step);
            let mut buffer = Buffer::new(&mut font_system, metrics);
            buffer.set_wrap(&mut font_system, Wrap::None);
            let attrs = Attrs::new().family(family);
            buffer.set_text(&mut font_system, text, attrs, Shaping::Advanced);
            buffer.shape_until_scroll(&mut font_system, false);
            buffer
        };

        let cosmic_color = CosmicColor::rgba(color[0], color[1], color[2], color[3]);
        let mut font_system = self.font_system.lock().await;
        let mut swash_cache = self.swash_cache.lock().await;

        buffer.draw(
            &mut font_system,
            &mut swash_cache,
            cosmic_color,
            |px_x, px_y, _w, _h, pixel_color| {
                let img_x = x + px_x;
                let img_y = y + px_y;
                if img_x < 0
                    || img_y < 0
                    || img_x >= canvas.width() as i32
                    || img_y >= canvas.height() as i32
                {
                    return;
                }
                let existing = canvas.get_pixel(img_x as u32, img_y as u32);
                let alpha = pixel_color.a() as f32 / 255.0;
                let inv_alpha = 1.0 - alpha;
                let blended = Rgba([
                    ((pixel_color.r() as f32 * alpha) + (existing[0] as f32 * inv_alpha)) as u8,
                    ((pixel_color.g() as f32 * alpha) + (existing[1] as f32 * inv_alpha)) as u8,
                    ((pixel_color.b() as f32 * alpha) + (existing[2] as f32 * inv_alpha)) as u8,
                    existing[3].max(pixel_color.a()),
                ]);
                canvas.put_pixel(img_x as u32, img_y as u32, blended);
            },
        );
    }
}

/// Stamp a free-hand poly-line as overlapping filled circles. Erase strokes
/// paint opaque white, matching a paper page.
fn apply_stroke(canvas: &mut RgbaImage, stroke: &Stroke) -> TypesetResult<()> {
    if stroke.points.is_empty() {
        return Ok(());
    }
    let color = match stroke.mode {
        StrokeMode::Erase => Rgba([255, 255, 255, 255]),
        StrokeMode::Paint => parse_hex_color(&stroke.color)?,
    };
    let radius = (stroke.size.max(1) / 2).max(1) as i32;

    let mut stamp = |x: f32, y: f32| {
        draw_filled_circle_mut(canvas, (x.round() as i32, y.round() as i32), radius, color);
    };

    if stroke.points.len() == 1 {
        let (x, y) = stroke.points[0];
        stamp(x, y);
        return Ok(());
    }

    for pair in stroke.points.windows(2) {
        let (x1, y1) = pair[0];
        let (x2, y2) = pair[1];
        let dist = ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt();
        let steps = dist.ceil().max(1.0) as u32;
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            stamp(x1 + (x2 - x1) * t, y1 + (y2 - y1) * t);
        }
    }
    Ok(())
}

/// Parse `#RRGGBB` or `#RRGGBBAA`.
pub fn parse_hex_color(value: &str) -> TypesetResult<Rgba<u8>> {
    let hex = value.trim().trim_start_matches('#');
    // get() instead of indexing: the length match is in bytes, so a
    // multi-byte input of byte length 6 or 8 must not slice.
    let parse = |range: std::ops::Range<usize>| -> TypesetResult<u8> {
        hex.get(range)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| TypesetError::InvalidColor(value.to_string()))
    };
    match hex.len() {
        6 => Ok(Rgba([parse(0..2)?, parse(2..4)?, parse(4..6)?, 255])),
        8 => Ok(Rgba([
            parse(0..2)?,
            parse(2..4)?,
            parse(4..6)?,
            parse(6..8)?,
        ])),
        _ => Err(TypesetError::InvalidColor(value.to_string())),
    }
}
