use crate::capture::frame::PixelFormat;
use crate::error::{PipelineError, Result};

/// Converts a raw sensor buffer into the RGBA layout of the passthrough pool
pub trait PixelConverter: Send + Sync {
    fn convert(
        &self,
        format: PixelFormat,
        src: &[u8],
        width: u32,
        height: u32,
        dst: &mut [u8],
    ) -> Result<()>;
}

/// Software converter for the formats the synthetic and V4L2-style sources emit
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareConverter;

impl PixelConverter for SoftwareConverter {
    fn convert(
        &self,
        format: PixelFormat,
        src: &[u8],
        width: u32,
        height: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        let expected = format.frame_len(width, height);
        if src.len() < expected {
            return Err(PipelineError::Camera(format!(
                "{:?} frame {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                src.len()
            )));
        }
        let out_len = PixelFormat::Rgba32.frame_len(width, height);
        // A smaller frame would leave stale pixels in the tail of the buffer
        if dst.len() != out_len {
            return Err(PipelineError::FrameSize {
                pool: "passthrough_rgba",
                expected: dst.len(),
                actual: out_len,
            });
        }

        match format {
            PixelFormat::Rgba32 => {
                dst[..out_len].copy_from_slice(&src[..out_len]);
                Ok(())
            }
            PixelFormat::Nv12 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return Err(PipelineError::Camera(format!(
                        "NV12 needs even dimensions, got {}x{}",
                        width, height
                    )));
                }
                nv12_to_rgba(src, width as usize, height as usize, dst);
                Ok(())
            }
        }
    }
}

/// BT.601 limited-range NV12 to RGBA
fn nv12_to_rgba(src: &[u8], width: usize, height: usize, dst: &mut [u8]) {
    let (luma, chroma) = src.split_at(width * height);

    for y in 0..height {
        let uv_row = &chroma[(y / 2) * width..(y / 2) * width + width];
        let y_row = &luma[y * width..(y + 1) * width];
        let out_row = &mut dst[y * width * 4..(y + 1) * width * 4];

        for (x, px) in out_row.chunks_exact_mut(4).enumerate() {
            let c = y_row[x] as i32 - 16;
            let d = uv_row[x & !1] as i32 - 128;
            let e = uv_row[x | 1] as i32 - 128;

            px[0] = clamp((298 * c + 409 * e + 128) >> 8);
            px[1] = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
            px[2] = clamp((298 * c + 516 * d + 128) >> 8);
            px[3] = 255;
        }
    }
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv12(width: usize, height: usize, y: u8, u: u8, v: u8) -> Vec<u8> {
        let mut buf = vec![y; width * height];
        for _ in 0..(width * height / 4) {
            buf.push(u);
            buf.push(v);
        }
        buf
    }

    #[test]
    fn test_nv12_black_and_white() {
        let mut dst = vec![0u8; 4 * 4 * 4];

        SoftwareConverter
            .convert(PixelFormat::Nv12, &nv12(4, 4, 16, 128, 128), 4, 4, &mut dst)
            .unwrap();
        assert!(dst.chunks(4).all(|px| px == [0, 0, 0, 255]));

        SoftwareConverter
            .convert(PixelFormat::Nv12, &nv12(4, 4, 235, 128, 128), 4, 4, &mut dst)
            .unwrap();
        assert!(dst.chunks(4).all(|px| px == [255, 255, 255, 255]));
    }

    #[test]
    fn test_nv12_red_dominant() {
        let mut dst = vec![0u8; 2 * 2 * 4];
        SoftwareConverter
            .convert(PixelFormat::Nv12, &nv12(2, 2, 81, 90, 240), 2, 2, &mut dst)
            .unwrap();
        let px = &dst[..4];
        assert!(px[0] > 200, "red channel {}", px[0]);
        assert!(px[1] < 40 && px[2] < 40);
    }

    #[test]
    fn test_rgba_copy() {
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 16];
        SoftwareConverter
            .convert(PixelFormat::Rgba32, &src, 2, 2, &mut dst)
            .unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_destination_must_match_geometry() {
        let src = vec![1u8; 16];
        let mut dst = vec![0u8; 64];
        let err = SoftwareConverter
            .convert(PixelFormat::Rgba32, &src, 2, 2, &mut dst)
            .unwrap_err();
        assert!(matches!(err, PipelineError::FrameSize { expected: 64, actual: 16, .. }));
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_source_is_rejected() {
        let mut dst = vec![0u8; 16];
        let err = SoftwareConverter
            .convert(PixelFormat::Nv12, &[0u8; 3], 2, 2, &mut dst)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Camera(_)));
    }
}
