//! Conversion of raw pipeline buffers into packed BGR frames.

use common::span_debug;

use crate::{error::ConversionError, format::PixelFormat, frame::Frame};

/// Converts a raw pipeline buffer into a canonical BGR [`Frame`].
///
/// The caller drops the frame on error rather than yielding a corrupt image.
pub fn normalize(
    raw: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Frame, ConversionError> {
    let _s = span_debug!("normalize");

    let bpp = format
        .bytes_per_pixel()
        .ok_or(ConversionError::Compressed { format })?;
    let expected = width as usize * height as usize * bpp;
    if raw.len() != expected {
        return Err(ConversionError::SizeMismatch {
            expected,
            actual: raw.len(),
        });
    }

    let data = match format {
        PixelFormat::Bgr24 => raw,
        PixelFormat::Rgb24 => rgb_to_bgr(raw),
        PixelFormat::Gray8 => gray_to_bgr(&raw),
        PixelFormat::Yuyv422 => yuyv_to_bgr(&raw, width, height)?,
        PixelFormat::Mjpeg => return Err(ConversionError::Compressed { format }),
    };

    Ok(Frame::new(data, width, height))
}

fn rgb_to_bgr(mut raw: Vec<u8>) -> Vec<u8> {
    for px in raw.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    raw
}

fn gray_to_bgr(raw: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(raw.len() * 3);
    for &y in raw {
        bgr.extend_from_slice(&[y, y, y]);
    }
    bgr
}

/// YUYV (YUV 4:2:2) to BGR.
///
/// YUYV packs 2 pixels in 4 bytes: [Y0, U, Y1, V]
fn yuyv_to_bgr(raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConversionError> {
    if width % 2 != 0 {
        return Err(ConversionError::OddWidth { width });
    }

    let mut bgr = vec![0u8; width as usize * height as usize * 3];
    let mut out_idx = 0;

    for chunk in raw.chunks_exact(4) {
        let y0 = chunk[0] as i32;
        let u = chunk[1] as i32 - 128;
        let y1 = chunk[2] as i32;
        let v = chunk[3] as i32 - 128;

        // BT.601 fixed-point coefficients (8-bit fraction)
        // R = Y + 1.402*V  -> Y + (359*V >> 8)
        // G = Y - 0.344*U - 0.714*V -> Y - ((88*U + 183*V) >> 8)
        // B = Y + 1.772*U -> Y + (454*U >> 8)
        let rv = (359 * v) >> 8;
        let gu = (88 * u + 183 * v) >> 8;
        let bu = (454 * u) >> 8;

        for y in [y0, y1] {
            bgr[out_idx] = (y + bu).clamp(0, 255) as u8;
            bgr[out_idx + 1] = (y - gu).clamp(0, 255) as u8;
            bgr[out_idx + 2] = (y + rv).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }

    Ok(bgr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgr_passes_through() {
        let raw = vec![1, 2, 3, 4, 5, 6];
        let frame = normalize(raw.clone(), 2, 1, PixelFormat::Bgr24).unwrap();
        assert_eq!(frame.data(), &raw[..]);
    }

    #[test]
    fn test_rgb_is_channel_swapped() {
        let raw = vec![255, 0, 10, 1, 2, 3];
        let frame = normalize(raw, 2, 1, PixelFormat::Rgb24).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([10, 0, 255]));
        assert_eq!(frame.pixel(1, 0), Some([3, 2, 1]));
    }

    #[test]
    fn test_gray_replicates_channels() {
        let frame = normalize(vec![7, 200], 2, 1, PixelFormat::Gray8).unwrap();
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.data(), &[7, 7, 7, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // Y=128 with neutral chroma decodes to mid gray
        let frame = normalize(vec![128, 128, 64, 128], 2, 1, PixelFormat::Yuyv422).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([128, 128, 128]));
        assert_eq!(frame.pixel(1, 0), Some([64, 64, 64]));
    }

    #[test]
    fn test_yuyv_output_is_bgr_ordered() {
        // Strong V (red-difference) with neutral U: red channel dominates,
        // and red is the last byte of each pixel.
        let frame = normalize(vec![128, 128, 128, 255], 2, 1, PixelFormat::Yuyv422).unwrap();
        let [b, g, r] = frame.pixel(0, 0).unwrap();
        assert_eq!(r, 255);
        assert_eq!(b, 128);
        assert!(g < 128);
    }

    #[test]
    fn test_yuyv_odd_width_is_rejected() {
        let err = normalize(vec![0u8; 6], 3, 1, PixelFormat::Yuyv422).unwrap_err();
        assert_eq!(err, ConversionError::OddWidth { width: 3 });
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let err = normalize(vec![0u8; 5], 2, 1, PixelFormat::Bgr24).unwrap_err();
        assert_eq!(
            err,
            ConversionError::SizeMismatch {
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn test_mjpeg_is_not_convertible() {
        let err = normalize(vec![0xFF, 0xD8], 1, 1, PixelFormat::Mjpeg).unwrap_err();
        assert_eq!(
            err,
            ConversionError::Compressed {
                format: PixelFormat::Mjpeg
            }
        );
    }
}
