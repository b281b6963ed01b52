//! Conversions between [`Frame`] and `image` buffers, plus crop-and-resize.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rollcall_hw::Frame;

/// Copy a frame into an `RgbImage`. `None` if the buffer size is inconsistent.
pub fn to_rgb_image(frame: &Frame) -> Option<RgbImage> {
    RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
}

/// Crop `region` out of `img` (clamped to the image) and resize it to `size`×`size`.
///
/// Returns the resized crop and the crop's top-left corner and side scale,
/// so callers can map crop coordinates back into frame space.
pub fn crop_square(img: &RgbImage, region: &FaceBox, size: u32) -> Option<(RgbImage, CropInfo)> {
    let x0 = region.x.max(0.0).floor() as u32;
    let y0 = region.y.max(0.0).floor() as u32;
    let x1 = (region.x + region.width).min(img.width() as f32).ceil() as u32;
    let y1 = (region.y + region.height).min(img.height() as f32).ceil() as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let (w, h) = (x1 - x0, y1 - y0);
    let cropped = imageops::crop_imm(img, x0, y0, w, h).to_image();
    let resized = imageops::resize(&cropped, size, size, FilterType::Triangle);

    Some((
        resized,
        CropInfo {
            origin_x: x0 as f32,
            origin_y: y0 as f32,
            scale_x: w as f32 / size as f32,
            scale_y: h as f32 / size as f32,
        },
    ))
}

/// Maps points in a resized crop back to frame coordinates.
#[derive(Debug, Clone, Copy)]
pub struct CropInfo {
    pub origin_x: f32,
    pub origin_y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl CropInfo {
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale_x, self.origin_y + y * self.scale_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_box(x: f32, y: f32, w: f32, h: f32) -> FaceBox {
        FaceBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_to_rgb_image_dimensions() {
        let frame = Frame::filled(8, 4, [1, 2, 3]);
        let img = to_rgb_image(&frame).unwrap();
        assert_eq!(img.dimensions(), (8, 4));
        assert_eq!(img.get_pixel(7, 3).0, [1, 2, 3]);
    }

    #[test]
    fn test_crop_square_maps_back() {
        let img = RgbImage::new(100, 100);
        let (crop, info) = crop_square(&img, &sample_box(20.0, 30.0, 40.0, 40.0), 20).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        let (fx, fy) = info.to_frame(10.0, 10.0);
        assert!((fx - 40.0).abs() < 1e-4);
        assert!((fy - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_square_clamps_to_image() {
        let img = RgbImage::new(50, 50);
        let (_, info) = crop_square(&img, &sample_box(-10.0, -10.0, 30.0, 30.0), 10).unwrap();
        assert_eq!(info.origin_x, 0.0);
        assert_eq!(info.origin_y, 0.0);
        assert!((info.scale_x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_square_outside_image() {
        let img = RgbImage::new(50, 50);
        assert!(crop_square(&img, &sample_box(60.0, 60.0, 10.0, 10.0), 10).is_none());
    }
}
