//! Image input handling: decoding submitted frames and cropping face regions.
//!
//! Frames arrive either as raw encoded bytes (PNG/JPEG/…) or as a
//! `data:image/...;base64,` URI from a browser camera loop. Both decode to a
//! [`PixelBuffer`] holding interleaved RGB plus a derived luma plane.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::types::BoundingBox;

/// Padding added around a detection before encoding, in source pixels.
const CROP_PADDING: u32 = 20;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),
}

/// Decoded frame: interleaved RGB plus a BT.601 luma plane.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    pub luma: Vec<u8>,
}

impl PixelBuffer {
    /// Decode an encoded image (PNG, JPEG, …) from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ImageError::InvalidImageFormat(e.to_string()))?;
        let rgb_img = decoded.to_rgb8();
        let (width, height) = rgb_img.dimensions();
        let rgb = rgb_img.into_raw();
        let luma = luma_plane(&rgb);
        Ok(Self {
            width,
            height,
            rgb,
            luma,
        })
    }

    /// Decode a base64 payload, with or without a `data:image/...;base64,`
    /// prefix.
    pub fn from_base64_payload(payload: &str) -> Result<Self, ImageError> {
        let encoded = match payload.strip_prefix("data:") {
            Some(rest) => rest
                .split_once(',')
                .map(|(_, data)| data)
                .ok_or_else(|| ImageError::InvalidImageFormat("data URI has no payload".into()))?,
            None => payload,
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ImageError::InvalidImageFormat(format!("base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Extract the face region around a detection, expanded by
    /// [`CROP_PADDING`] and clamped to the frame bounds.
    pub fn crop_face(&self, face: &BoundingBox) -> FaceCrop {
        let x0 = ((face.x as i64 - CROP_PADDING as i64).max(0) as u32)
            .min(self.width.saturating_sub(1));
        let y0 = ((face.y as i64 - CROP_PADDING as i64).max(0) as u32)
            .min(self.height.saturating_sub(1));
        let x1 = ((face.x + face.width) as i64 + CROP_PADDING as i64).min(self.width as i64) as u32;
        let y1 =
            ((face.y + face.height) as i64 + CROP_PADDING as i64).min(self.height as i64) as u32;

        let w = x1.saturating_sub(x0).max(1);
        let h = y1.saturating_sub(y0).max(1);

        let mut rgb = Vec::with_capacity((w * h * 3) as usize);
        let mut luma = Vec::with_capacity((w * h) as usize);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let pi = (y * self.width + x) as usize;
                rgb.extend_from_slice(&self.rgb[pi * 3..pi * 3 + 3]);
                luma.push(self.luma[pi]);
            }
        }

        FaceCrop {
            width: w,
            height: h,
            rgb,
            luma,
        }
    }
}

/// Cropped face region, carried through quality, liveness and encoding.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    pub luma: Vec<u8>,
}

/// BT.601 luma from interleaved RGB.
fn luma_plane(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Bilinear resize of a single-channel plane.
pub fn resize_luma(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    resize_plane::<1>(src, src_w, src_h, dst_w, dst_h)
}

/// Bilinear resize of an interleaved RGB plane.
pub fn resize_rgb(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    resize_plane::<3>(src, src_w, src_h, dst_w, dst_h)
}

fn resize_plane<const C: usize>(src: &[u8], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<u8> {
    let (src_w, src_h) = (src_w as usize, src_h as usize);
    let (dst_w, dst_h) = (dst_w as usize, dst_h as usize);
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    let mut dst = vec![0u8; dst_w * dst_h * C];
    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..C {
                let tl = src[(y0 * src_w + x0) * C + c] as f32;
                let tr = src[(y0 * src_w + x1) * C + c] as f32;
                let bl = src[(y1 * src_w + x0) * C + c] as f32;
                let br = src[(y1 * src_w + x1) * C + c] as f32;
                let v = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;
                dst[(y * dst_w + x) * C + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    pub(crate) fn encode_png(width: u32, height: u32, rgb: &[u8]) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, _> =
            ImageBuffer::from_raw(width, height, rgb.to_vec()).unwrap();
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = PixelBuffer::from_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ImageError::InvalidImageFormat(_)));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = PixelBuffer::from_base64_payload("!!!not base64!!!").unwrap_err();
        assert!(matches!(err, ImageError::InvalidImageFormat(_)));
    }

    #[test]
    fn decode_rejects_data_uri_without_payload() {
        let err = PixelBuffer::from_base64_payload("data:image/png;base64").unwrap_err();
        assert!(matches!(err, ImageError::InvalidImageFormat(_)));
    }

    #[test]
    fn roundtrip_png_bytes() {
        let rgb = vec![200u8, 140, 110, 60, 40, 35, 200, 140, 110, 60, 40, 35];
        let png = encode_png(2, 2, &rgb);
        let buf = PixelBuffer::from_bytes(&png).unwrap();
        assert_eq!(buf.width, 2);
        assert_eq!(buf.height, 2);
        assert_eq!(buf.rgb, rgb);
        assert_eq!(buf.luma.len(), 4);
    }

    #[test]
    fn decodes_data_uri() {
        let png = encode_png(3, 3, &vec![128u8; 27]);
        let uri = format!("data:image/png;base64,{}", BASE64.encode(&png));
        let buf = PixelBuffer::from_base64_payload(&uri).unwrap();
        assert_eq!(buf.width, 3);
        assert_eq!(buf.height, 3);
    }

    #[test]
    fn decodes_bare_base64() {
        let png = encode_png(2, 2, &vec![64u8; 12]);
        let buf = PixelBuffer::from_base64_payload(&BASE64.encode(&png)).unwrap();
        assert_eq!(buf.width, 2);
    }

    #[test]
    fn crop_is_clamped_to_frame() {
        let png = encode_png(40, 40, &vec![100u8; 40 * 40 * 3]);
        let buf = PixelBuffer::from_bytes(&png).unwrap();
        let face = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 40.0,
            height: 40.0,
            confidence: 1.0,
        };
        // Padding would extend past every edge; crop must stay in bounds.
        let crop = buf.crop_face(&face);
        assert_eq!(crop.width, 40);
        assert_eq!(crop.height, 40);
        assert_eq!(crop.luma.len(), 1600);
    }

    #[test]
    fn crop_includes_padding_when_available() {
        let png = encode_png(200, 200, &vec![100u8; 200 * 200 * 3]);
        let buf = PixelBuffer::from_bytes(&png).unwrap();
        let face = BoundingBox {
            x: 80.0,
            y: 80.0,
            width: 40.0,
            height: 40.0,
            confidence: 1.0,
        };
        let crop = buf.crop_face(&face);
        assert_eq!(crop.width, 80);
        assert_eq!(crop.height, 80);
    }

    #[test]
    fn resize_uniform_plane_stays_uniform() {
        let src = vec![128u8; 50 * 50];
        let dst = resize_luma(&src, 50, 50, 100, 100);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn resize_rgb_preserves_channels() {
        let mut src = Vec::new();
        for _ in 0..(10 * 10) {
            src.extend_from_slice(&[200, 140, 110]);
        }
        let dst = resize_rgb(&src, 10, 10, 20, 20);
        assert_eq!(dst.len(), 20 * 20 * 3);
        assert!(dst.chunks_exact(3).all(|px| px == [200, 140, 110]));
    }
}
