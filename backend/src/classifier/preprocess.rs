use image::imageops::{self, FilterType};
use image::DynamicImage;
use ndarray::Array4;

/// Side length of the square input the model was trained on.
pub const INPUT_SIZE: u32 = 30;
pub const INPUT_CHANNELS: usize = 3;

/// Converts an image into the `[1, 30, 30, 3]` NHWC batch the model expects.
///
/// The image is converted to RGB and stretched to 30x30 with a bicubic
/// filter, ignoring aspect ratio. Pixel values stay in the 0-255 range the
/// model was trained on.
pub fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let side = INPUT_SIZE as usize;
    Array4::from_shape_fn((1, side, side, INPUT_CHANNELS), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32
    })
}
