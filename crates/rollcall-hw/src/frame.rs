//! Frame type and pixel helpers: YUYV conversion, mirroring, marker drawing.

use std::time::Instant;

/// An RGB colour triple.
pub type Rgb = [u8; 3];

/// A captured colour camera frame.
///
/// Pixels are packed RGB, row-major, `width * height * 3` bytes.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    /// Capture sequence number assigned by the frame source.
    pub sequence: u64,
}

impl Frame {
    /// Wrap a packed RGB buffer, checking that its length matches the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
        })
    }

    /// A uniformly coloured frame.
    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        let data = color
            .iter()
            .copied()
            .cycle()
            .take(rgb_len(width, height))
            .collect();
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let off = self.offset(x, y);
        Some([self.data[off], self.data[off + 1], self.data[off + 2]])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if x >= self.width || y >= self.height {
            return;
        }
        let off = self.offset(x, y);
        self.data[off..off + 3].copy_from_slice(&color);
    }

    /// Flip the frame left-to-right in place (selfie view).
    pub fn mirror_horizontal(&mut self) {
        let row_bytes = self.width as usize * 3;
        if row_bytes == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(row_bytes) {
            let w = row.len() / 3;
            for x in 0..w / 2 {
                let (left, right) = (x * 3, (w - 1 - x) * 3);
                for c in 0..3 {
                    row.swap(left + c, right + c);
                }
            }
        }
    }

    /// Draw a filled disc centred on `(cx, cy)`. Pixels outside the frame are clipped.
    pub fn draw_dot(&mut self, cx: f32, cy: f32, radius: u32, color: Rgb) {
        let r = radius as i64;
        let (cx, cy) = (cx.round() as i64, cy.round() as i64);
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy > r * r {
                    continue;
                }
                let (x, y) = (cx + dx, cy + dy);
                if x < 0 || y < 0 {
                    continue;
                }
                self.put_pixel(x as u32, y as u32, color);
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Convert packed YUYV (4:2:2) to packed RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1] as f32 - 128.0, quad[3] as f32 - 128.0);
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
