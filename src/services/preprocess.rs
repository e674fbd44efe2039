//! Image preprocessing for the classification models.
//!
//! Every registered model takes a `[1, 224, 224, 3]` NHWC float tensor. Only
//! the per-pixel transform differs between model families.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;

use crate::services::inference::InferenceError;
use crate::services::registry::{Preprocess, INPUT_SIZE};

/// Per-channel means subtracted in caffe mode, in BGR order.
pub const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Resize to the model input size with nearest-neighbour sampling and
/// build the input tensor.
pub fn preprocess(image: &DynamicImage, mode: Preprocess) -> Result<Array4<f32>, InferenceError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(InferenceError::Preprocess(format!(
            "image has no pixels ({}x{})",
            width, height
        )));
    }

    let size = INPUT_SIZE;
    let resized = if image.dimensions() == (size, size) {
        image.to_rgb8()
    } else {
        image.resize_exact(size, size, FilterType::Nearest).to_rgb8()
    };

    let side = size as usize;
    let mut tensor = Array4::zeros((1, side, side, 3));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let rgb = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
        let values = transform(rgb, mode);
        for (c, value) in values.into_iter().enumerate() {
            tensor[[0, y as usize, x as usize, c]] = value;
        }
    }

    Ok(tensor)
}

fn transform([r, g, b]: [f32; 3], mode: Preprocess) -> [f32; 3] {
    match mode {
        Preprocess::PassThrough => [r, g, b],
        Preprocess::Symmetric => [r / 127.5 - 1.0, g / 127.5 - 1.0, b / 127.5 - 1.0],
        Preprocess::Caffe => [
            b - CAFFE_MEAN_BGR[0],
            g - CAFFE_MEAN_BGR[1],
            r - CAFFE_MEAN_BGR[2],
        ],
    }
}
