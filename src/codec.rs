use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::source::Frame;

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let expected = (frame.width as usize) * (frame.height as usize) * 3;
    if frame.is_empty() || frame.rgb.len() != expected {
        bail!(
            "frame buffer holds {} bytes, expected {} for {}x{} rgb24",
            frame.rgb.len(),
            expected,
            frame.width,
            frame.height
        );
    }
    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("jpeg encode")?;
    Ok(out)
}
