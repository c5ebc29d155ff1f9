use image::{imageops, imageops::FilterType, ImageBuffer, Luma, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use rayon::prelude::*;

use crate::{
    errors::{DeepLabError, Result},
    labels::ClassTable,
    model_config::ChannelOrder,
};

/// Spatial size of a network input, width first like the `image` crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

/// Resolution the Cityscapes checkpoint was calibrated at.
pub const PREDEFINED_INPUT_SIZE: InputSize = InputSize {
    width: 1024,
    height: 512,
};

/// A preprocessed image plus the size the prediction must be mapped back to.
#[derive(Debug, Clone)]
pub struct NetworkInput {
    /// `(1, 3, h, w)` with raw 0-255 values.
    pub tensor: Array4<f32>,
    pub height: u32,
    pub width: u32,
}

/// Convert an RGB image into the network's NCHW layout.
///
/// `target` resizes (bilinear) before conversion; `None` keeps the native
/// resolution. The original size is recorded either way.
pub fn preprocess(image: &RgbImage, target: Option<InputSize>, order: ChannelOrder) -> NetworkInput {
    let (width, height) = image.dimensions();
    let resized;
    let source = match target {
        Some(size) if (size.width, size.height) != (width, height) => {
            resized = imageops::resize(image, size.width, size.height, FilterType::Triangle);
            &resized
        }
        _ => image,
    };

    let view = source.as_ndarray3();
    let view = match order {
        ChannelOrder::Rgb => view.slice_move(s![NewAxis, .., .., ..]),
        ChannelOrder::Bgr => view.slice_move(s![NewAxis, ..;-1, .., ..]),
    };

    NetworkInput {
        tensor: view.mapv(f32::from),
        height,
        width,
    }
}

/// Per-pixel class indices, same size as the source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    image: ImageBuffer<Luma<u16>, Vec<u16>>,
}

impl LabelMask {
    pub fn from_raw(width: u32, height: u32, labels: Vec<u16>) -> Result<Self> {
        let len = labels.len();
        ImageBuffer::from_raw(width, height, labels)
            .map(|image| Self { image })
            .ok_or_else(|| DeepLabError::Validation {
                field: "label mask".to_string(),
                reason: format!("{len} labels do not fill a {width}x{height} mask"),
            })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        self.image.get_pixel_checked(x, y).map(|p| p.0[0])
    }

    pub fn labels(&self) -> &[u16] {
        self.image.as_raw()
    }

    /// `(height, width)` view, row-major.
    pub fn as_array(&self) -> Result<ArrayView2<'_, u16>> {
        Ok(ArrayView2::from_shape(
            (self.height() as usize, self.width() as usize),
            self.image.as_raw(),
        )?)
    }

    pub fn as_image(&self) -> &ImageBuffer<Luma<u16>, Vec<u16>> {
        &self.image
    }

    pub fn into_image(self) -> ImageBuffer<Luma<u16>, Vec<u16>> {
        self.image
    }

    /// Paint every pixel with its class color. Labels outside the table are
    /// black.
    pub fn colorize(&self, table: &ClassTable) -> RgbImage {
        let mut out = RgbImage::new(self.width(), self.height());
        out.par_chunks_mut(3)
            .zip(self.image.as_raw().par_iter())
            .for_each(|(pixel, &label)| {
                let color = table
                    .get(label)
                    .map_or([0, 0, 0], |e| [e.color.0[0], e.color.0[1], e.color.0[2]]);
                pixel.copy_from_slice(&color);
            });
        out
    }

    /// Blend the colorized mask over `image` with the given mask opacity.
    pub fn overlay(&self, image: &RgbImage, table: &ClassTable, alpha: f32) -> Result<RgbImage> {
        if image.dimensions() != self.dimensions() {
            return Err(DeepLabError::Validation {
                field: "overlay".to_string(),
                reason: format!(
                    "image is {:?} but mask is {:?}",
                    image.dimensions(),
                    self.dimensions()
                ),
            });
        }

        let alpha = alpha.clamp(0.0, 1.0);
        let mut out = self.colorize(table);
        out.par_iter_mut()
            .zip(image.as_raw().par_iter())
            .for_each(|(mask, &source)| {
                *mask = (f32::from(*mask) * alpha + f32::from(source) * (1.0 - alpha)).round() as u8;
            });
        Ok(out)
    }
}

/// Reduce a `(C, H, W)` score map to one label per pixel.
///
/// Ties resolve to the lowest class index; NaN never wins a comparison.
pub fn argmax_labels(scores: ArrayView3<f32>) -> Result<LabelMask> {
    let (classes, height, width) = scores.dim();
    if classes == 0 {
        return Err(DeepLabError::inference(
            "argmax",
            "score map has no class channels",
        ));
    }
    if classes > usize::from(u16::MAX) + 1 {
        return Err(DeepLabError::inference(
            "argmax",
            format!("{classes} classes do not fit in a 16-bit mask"),
        ));
    }

    let mut labels = vec![0u16; height * width];
    labels
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, label) in row.iter_mut().enumerate() {
                let mut best = 0;
                let mut best_score = scores[[0, y, x]];
                for class in 1..classes {
                    let score = scores[[class, y, x]];
                    if score > best_score {
                        best = class;
                        best_score = score;
                    }
                }
                *label = best as u16;
            }
        });

    LabelMask::from_raw(width as u32, height as u32, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_keeps_native_size() {
        let image = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        let input = preprocess(&image, None, ChannelOrder::Rgb);
        assert_eq!(input.tensor.shape(), &[1, 3, 30, 40]);
        assert_eq!((input.width, input.height), (40, 30));
        assert_eq!(input.tensor[[0, 0, 0, 0]], 10.0);
        assert_eq!(input.tensor[[0, 2, 0, 0]], 30.0);
    }

    #[test]
    fn test_preprocess_resizes_and_records_original() {
        let image = RgbImage::from_pixel(64, 48, Rgb([1, 2, 3]));
        let input = preprocess(&image, Some(PREDEFINED_INPUT_SIZE), ChannelOrder::Rgb);
        assert_eq!(input.tensor.shape(), &[1, 3, 512, 1024]);
        assert_eq!((input.width, input.height), (64, 48));
    }

    #[test]
    fn test_preprocess_bgr_reverses_channels() {
        let image = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        let input = preprocess(&image, None, ChannelOrder::Bgr);
        assert_eq!(input.tensor[[0, 0, 1, 1]], 30.0);
        assert_eq!(input.tensor[[0, 1, 1, 1]], 20.0);
        assert_eq!(input.tensor[[0, 2, 1, 1]], 10.0);
    }

    #[test]
    fn test_argmax_picks_highest_class() -> Result<()> {
        let mut scores = Array3::<f32>::zeros((3, 2, 2));
        scores[[2, 0, 0]] = 1.0;
        scores[[1, 1, 1]] = 5.0;
        scores[[0, 0, 1]] = 0.5;

        let mask = argmax_labels(scores.view())?;
        assert_eq!(mask.dimensions(), (2, 2));
        assert_eq!(mask.get(0, 0), Some(2));
        assert_eq!(mask.get(1, 0), Some(0));
        assert_eq!(mask.get(1, 1), Some(1));
        Ok(())
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() -> Result<()> {
        let mut scores = Array3::<f32>::zeros((4, 1, 3));
        scores[[1, 0, 0]] = 2.0;
        scores[[3, 0, 0]] = 2.0;
        scores[[2, 0, 1]] = 7.0;
        scores[[3, 0, 1]] = 7.0;

        let mask = argmax_labels(scores.view())?;
        assert_eq!(mask.labels(), &[1, 2, 0]);
        Ok(())
    }

    #[test]
    fn test_argmax_rejects_empty_class_axis() {
        let scores = Array3::<f32>::zeros((0, 2, 2));
        assert!(argmax_labels(scores.view()).is_err());
    }

    #[test]
    fn test_as_array_is_height_by_width() -> Result<()> {
        let mask = LabelMask::from_raw(3, 2, vec![0, 1, 2, 3, 4, 5])?;
        let array = mask.as_array()?;
        assert_eq!(array.dim(), (2, 3));
        assert_eq!(array[[1, 0]], 3);
        Ok(())
    }

    #[test]
    fn test_colorize_and_overlay() -> Result<()> {
        let table = ClassTable::from_names(&["a", "b"], 10);
        let mask = LabelMask::from_raw(2, 1, vec![1, 7])?;

        let colored = mask.colorize(&table);
        let [r, g, b, _] = table.entries()[1].color.0;
        assert_eq!(*colored.get_pixel(0, 0), Rgb([r, g, b]));
        assert_eq!(*colored.get_pixel(1, 0), Rgb([0, 0, 0]));

        let source = RgbImage::from_pixel(2, 1, Rgb([200, 200, 200]));
        let blended = mask.overlay(&source, &table, 0.0)?;
        assert_eq!(blended, source);
        assert!(mask
            .overlay(&RgbImage::new(3, 3), &table, 0.5)
            .is_err());
        Ok(())
    }
}
