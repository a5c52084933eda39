// Shared data contracts for the webtoon translation pipeline.
//
// Everything here is serde-serializable: the detection/translation/typeset
// payloads are persisted verbatim on the Page row and fully overwritten on
// each (re)run.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 / 2.0,
            self.y as f32 + self.h as f32 / 2.0,
        )
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        px >= self.x as f32
            && px < self.right() as f32
            && py >= self.y as f32
            && py < self.bottom() as f32
    }

    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 > x1 && y2 > y1 {
            Some(BBox::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    /// Intersection area divided by this box's own area.
    pub fn overlap_ratio(&self, other: &BBox) -> f64 {
        let own = self.area();
        if own == 0 {
            return 0.0;
        }
        match self.intersection(other) {
            Some(i) => i.area() as f64 / own as f64,
            None => 0.0,
        }
    }

    pub fn union(&self, other: &BBox) -> BBox {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        BBox::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn contains(&self, other: &BBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// One raw detected text box with its recognized text and confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub bbox: BBox,
    pub text: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_id: Option<usize>,
}

impl Region {
    pub fn new(bbox: BBox, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            text: text.into(),
            confidence,
            panel_id: None,
            bubble_id: None,
        }
    }
}

/// A candidate speech-bubble shape (not necessarily containing text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bubble {
    pub id: usize,
    pub bbox: BBox,
    pub area: f64,
    pub solidity: f64,
}

/// A candidate comic-panel boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub id: usize,
    pub bbox: BBox,
}

/// One coherent piece of dialogue, possibly spanning multiple Regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: usize,
    pub region_indices: Vec<usize>,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<usize>,
    pub is_ungrouped: bool,
}

/// Structured detection payload persisted per Page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub regions: Vec<Region>,
    pub bubble_groups: Vec<Group>,
    pub panel_boundaries: Vec<Panel>,
    pub detected_bubbles: Vec<Bubble>,
}

impl DetectionPayload {
    /// Fallback shape: one Region = one Group, no panels, no bubbles.
    pub fn ungrouped(regions: Vec<Region>) -> Self {
        let groups = regions
            .iter()
            .enumerate()
            .map(|(i, r)| Group {
                id: i,
                region_indices: vec![i],
                bbox: r.bbox,
                panel_id: None,
                is_ungrouped: true,
            })
            .collect();
        Self {
            regions,
            bubble_groups: groups,
            panel_boundaries: Vec::new(),
            detected_bubbles: Vec::new(),
        }
    }
}

/// One entry of the per-page translation payload, in group reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedRegion {
    pub text: String,
    pub bbox: BBox,
    pub confidence: f32,
}

/// Glossary entry forwarded to the translation provider for name consistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source_name: String,
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

/// Reading mode of a job: discrete pages or a continuous vertical strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingMode {
    #[default]
    SinglePage,
    Strip,
}

/// Text-removal tier selected per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMethod {
    #[default]
    Fast,
    Quality,
}

fn default_font_size() -> u32 {
    24
}

fn default_line_height() -> f32 {
    1.2
}

fn default_text_color() -> String {
    "#000000".to_string()
}

fn default_stroke_color() -> String {
    "#FFFFFF".to_string()
}

fn default_align() -> TextAlign {
    TextAlign::Center
}

fn default_valign() -> VerticalAlign {
    VerticalAlign::Middle
}

/// Horizontal alignment inside a typeset box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

/// Vertical alignment inside a typeset box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalAlign {
    Top,
    Middle,
    Bottom,
}

/// One manually-edited text box to composite onto a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypesetRegion {
    pub bbox: BBox,
    #[serde(default)]
    pub user_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_text_color")]
    pub color: String,
    #[serde(default = "default_stroke_color")]
    pub stroke_color: String,
    #[serde(default)]
    pub stroke_width: u32,
    #[serde(default = "default_line_height")]
    pub line_height: f32,
    #[serde(default = "default_align")]
    pub align: TextAlign,
    #[serde(default = "default_valign")]
    pub vertical_align: VerticalAlign,
    #[serde(default)]
    pub letter_spacing: f32,
    #[serde(default)]
    pub is_vertical: bool,
}

impl TypesetRegion {
    /// Pipeline-generated text box with the stock styling.
    pub fn from_translation(bbox: BBox, text: impl Into<String>) -> Self {
        Self {
            bbox,
            user_text: text.into(),
            font_family: None,
            font_size: default_font_size(),
            color: default_text_color(),
            stroke_color: default_stroke_color(),
            stroke_width: 2,
            line_height: default_line_height(),
            align: default_align(),
            vertical_align: default_valign(),
            letter_spacing: 0.0,
            is_vertical: false,
        }
    }
}

/// Brush mode of a free-hand stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeMode {
    #[default]
    Paint,
    Erase,
}

fn default_stroke_size() -> u32 {
    12
}

/// One free-hand poly-line applied before text placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stroke {
    #[serde(default)]
    pub mode: StrokeMode,
    #[serde(default = "default_stroke_color")]
    pub color: String,
    #[serde(default = "default_stroke_size")]
    pub size: u32,
    #[serde(default)]
    pub points: Vec<(f32, f32)>,
}

/// Manual override payload persisted per Page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypesetOverrides {
    #[serde(default)]
    pub regions: Vec<TypesetRegion>,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
}

impl TypesetOverrides {
    pub fn is_empty(&self) -> bool {
        self.regions.iter().all(|r| r.user_text.trim().is_empty()) && self.strokes.is_empty()
    }
}

/// Detect if text contains CJK (Chinese, Japanese, Korean) characters.
/// CJK lines are merged without a separator and stacked per character when
/// laid out vertically.
pub fn is_cjk_text(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c,
            '\u{4E00}'..='\u{9FFF}' |  // CJK Unified Ideographs
            '\u{3040}'..='\u{309F}' |  // Hiragana
            '\u{30A0}'..='\u{30FF}' |  // Katakana
            '\u{AC00}'..='\u{D7AF}'    // Hangul
        )
    })
}
