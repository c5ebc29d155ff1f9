use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use log::{debug, warn};

use crate::{
    errors::{DeepLabError, Result},
    labels::ClassTable,
};

pub const LEGEND_WIDTH: u32 = 1000;
pub const LEGEND_HEIGHT: u32 = 1000;
pub const MAX_ROW_HEIGHT: u32 = 100;

const OFFSET_X: u32 = 10;
const OFFSET_Y: u32 = 5;
const INTERLINE: u32 = 5;
const MAX_TEXT_HEIGHT: f32 = 32.0;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Font used for class names in the legend.
pub struct LegendFont {
    font: FontVec,
    path: PathBuf,
}

impl std::fmt::Debug for LegendFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegendFont")
            .field("path", &self.path)
            .finish()
    }
}

impl LegendFont {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| DeepLabError::FileSystem {
            path: path.to_path_buf(),
            operation: "font read".to_string(),
            source: e,
        })?;
        let font = FontVec::try_from_vec(data).map_err(|e| DeepLabError::Validation {
            field: "font".to_string(),
            reason: format!("{} is not a usable font: {e}", path.display()),
        })?;
        Ok(Self {
            font,
            path: path.to_path_buf(),
        })
    }

    /// Use `path` if given, otherwise the first common system font found.
    pub fn locate(path: Option<&Path>) -> Result<Option<Self>> {
        if let Some(path) = path {
            return Self::from_file(path).map(Some);
        }
        let found = FONT_CANDIDATES
            .iter()
            .map(Path::new)
            .filter(|p| p.is_file())
            .find_map(|p| Self::from_file(p).ok());
        match &found {
            Some(font) => debug!("Legend font: {}", font.path.display()),
            None => warn!("No font found, legend will be drawn without class names"),
        }
        Ok(found)
    }
}

/// Row geometry for a legend of `class_count` entries. Rows shrink as the
/// class count grows; there is no pagination, so very large tables produce
/// unreadably thin rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegendLayout {
    pub row_height: u32,
    pub swatch_width: u32,
}

impl LegendLayout {
    pub fn for_class_count(class_count: usize) -> Self {
        let rows = u32::try_from(class_count.max(1)).unwrap_or(u32::MAX);
        Self {
            row_height: MAX_ROW_HEIGHT.min(LEGEND_HEIGHT / rows),
            swatch_width: LEGEND_WIDTH / 3,
        }
    }

    /// Swatch rectangle for row `row`, or `None` once the row is too thin to
    /// hold one.
    pub fn swatch(&self, row: u32) -> Option<Rect> {
        let height = self.row_height.checked_sub(2 * INTERLINE)?.max(1);
        let top = row * self.row_height + OFFSET_Y + INTERLINE;
        Some(Rect::at(OFFSET_X as i32, top as i32).of_size(self.swatch_width, height))
    }

    pub fn text_x(&self) -> i32 {
        (3 * OFFSET_X + self.swatch_width) as i32
    }

    pub fn text_scale(&self) -> PxScale {
        PxScale::from((self.row_height as f32 * 0.6).min(MAX_TEXT_HEIGHT))
    }
}

/// Render one swatch and name per class onto a fixed-size white canvas.
pub fn draw_legend(table: &ClassTable, font: Option<&LegendFont>) -> RgbImage {
    let mut legend = RgbImage::from_pixel(LEGEND_WIDTH, LEGEND_HEIGHT, Rgb([255, 255, 255]));
    let layout = LegendLayout::for_class_count(table.len());
    let scale = layout.text_scale();

    for (row, entry) in table.entries().iter().enumerate() {
        let row = row as u32;
        if row * layout.row_height >= LEGEND_HEIGHT {
            break;
        }
        let [r, g, b, _] = entry.color.0;
        if let Some(rect) = layout.swatch(row) {
            draw_filled_rect_mut(&mut legend, rect, Rgb([r, g, b]));
        }

        if let Some(font) = font {
            let (_, text_height) = text_size(scale, &font.font, &entry.name);
            let row_top = (row * layout.row_height + OFFSET_Y) as i32;
            let y = row_top + (layout.row_height as i32 - text_height as i32) / 2;
            draw_text_mut(
                &mut legend,
                Rgb([0, 0, 0]),
                layout.text_x(),
                y,
                scale,
                &font.font,
                &entry.name,
            );
        }
    }

    legend
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_height_capped_and_shrinking() {
        assert_eq!(LegendLayout::for_class_count(5).row_height, 100);
        assert_eq!(LegendLayout::for_class_count(20).row_height, 50);
        assert!(
            LegendLayout::for_class_count(20).row_height
                < LegendLayout::for_class_count(5).row_height
        );
        assert_eq!(LegendLayout::for_class_count(0).row_height, 100);
    }

    #[test]
    fn test_legend_size_is_fixed() {
        for count in [1, 5, 19, 200] {
            let names: Vec<String> = (0..count).map(|i| format!("class {i}")).collect();
            let legend = draw_legend(&ClassTable::from_names(&names, 10), None);
            assert_eq!(legend.dimensions(), (LEGEND_WIDTH, LEGEND_HEIGHT));
        }
    }

    #[test]
    fn test_swatch_uses_class_color() {
        let table = ClassTable::from_names(&["only"], 3);
        let legend = draw_legend(&table, None);
        let [r, g, b, _] = table.entries()[0].color.0;

        // Middle of the first swatch, and well right of it.
        assert_eq!(*legend.get_pixel(100, 50), Rgb([r, g, b]));
        assert_eq!(*legend.get_pixel(900, 50), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_thin_rows_skip_swatch() {
        let layout = LegendLayout::for_class_count(500);
        assert_eq!(layout.row_height, 2);
        assert!(layout.swatch(0).is_none());
    }
}
