use std::path::Path;

use image::{GrayImage, ImageReader};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{PipelineError, Result};
use crate::sampling::resize_hwc;

/// HWC float frame in BGR channel order.
pub type ImageTensor = Array3<f32>;

/// Per-channel BGR mean subtracted from segmentation input.
pub const DEFAULT_IMAGE_MEAN: [f32; 3] = [104.006_99, 116.668_77, 122.678_92];

/// Decode an image file as 3-channel color and return it as a BGR tensor
/// with values in `[0, 255]`.
pub fn decode_bgr(path: &Path) -> Result<ImageTensor> {
    let decoded = ImageReader::open(path)
        .map_err(|source| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(source),
        })?
        .with_guessed_format()
        .map_err(|source| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(source),
        })?
        .decode()
        .map_err(|source| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            source,
        })?;

    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Array3::from_shape_fn(
        (height as usize, width as usize, 3),
        |(y, x, c)| rgb.get_pixel(x as u32, y as u32)[2 - c] as f32,
    ))
}

/// Mean-subtracted frame resized to the segmentation input size.
pub fn segmentation_input(
    frame: ArrayView3<'_, f32>,
    mean: [f32; 3],
    size: (usize, usize),
) -> ImageTensor {
    let mut centered = frame.to_owned();
    for (c, mut channel) in centered.axis_iter_mut(Axis(2)).enumerate() {
        channel -= mean[c];
    }
    resize_hwc(centered.view(), size.0, size.1)
}

/// Frame scaled to `[0, 1]` and resized to the flow input size.
pub fn flow_input(frame: ArrayView3<'_, f32>, size: (usize, usize)) -> ImageTensor {
    let unit = frame.mapv(|v| v / 255.0);
    resize_hwc(unit.view(), size.0, size.1)
}

/// Convert a label plane to an 8-bit grayscale image.
pub fn label_image(labels: ArrayView2<'_, u8>) -> GrayImage {
    let (h, w) = labels.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        image::Luma([labels[[y as usize, x as usize]]])
    })
}
