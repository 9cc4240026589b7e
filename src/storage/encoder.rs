use std::io::{self, Write};

use png::{AdaptiveFilterType, BitDepth, ColorType, Compression};

use crate::ImageFormat;

/// Serializes an 8-bit mono frame into an image file body.
pub trait Encoder: Send + Sync {
    fn extension(&self) -> &'static str;

    /// Write the frame to `out`, embedding `comment` where the format allows it.
    /// Returns the number of bytes written.
    fn serialize(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        comment: &str,
        out: &mut dyn Write,
    ) -> io::Result<usize>;
}

pub fn encoder_for(format: ImageFormat) -> Box<dyn Encoder> {
    match format {
        ImageFormat::Pgm => Box::new(PgmEncoder),
        ImageFormat::Png => Box::new(PngGrayEncoder),
    }
}

/// Binary PGM (P5) with the comment in the header
pub struct PgmEncoder;

impl Encoder for PgmEncoder {
    fn extension(&self) -> &'static str {
        "pgm"
    }

    fn serialize(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        comment: &str,
        out: &mut dyn Write,
    ) -> io::Result<usize> {
        check_len(pixels, width, height)?;
        // A newline would end the comment early and corrupt the header.
        let comment = comment.replace(['\n', '\r'], " ");
        let header = format!("P5\n# {comment}\n{width} {height}\n255\n");
        out.write_all(header.as_bytes())?;
        out.write_all(pixels)?;
        Ok(header.len() + pixels.len())
    }
}

/// PNG text keyword holding the capture timestamp
pub const PNG_TIMESTAMP_KEY: &str = "Title";

/// Grayscale PNG at maximum compression, timestamp in a `tEXt` chunk.
pub struct PngGrayEncoder;

impl Encoder for PngGrayEncoder {
    fn extension(&self) -> &'static str {
        "png"
    }

    fn serialize(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        comment: &str,
        out: &mut dyn Write,
    ) -> io::Result<usize> {
        check_len(pixels, width, height)?;
        let mut encoded = Vec::with_capacity(pixels.len() / 2);

        let mut encoder = png::Encoder::new(&mut encoded, width, height);
        encoder.set_color(ColorType::Grayscale);
        encoder.set_depth(BitDepth::Eight);
        encoder.set_compression(Compression::Best);
        encoder.set_adaptive_filter(AdaptiveFilterType::Adaptive);
        encoder
            .add_text_chunk(PNG_TIMESTAMP_KEY.to_string(), comment.to_string())
            .map_err(io::Error::other)?;

        let mut writer = encoder.write_header().map_err(io::Error::other)?;
        writer.write_image_data(pixels).map_err(io::Error::other)?;
        writer.finish().map_err(io::Error::other)?;

        out.write_all(&encoded)?;
        Ok(encoded.len())
    }
}

fn check_len(pixels: &[u8], width: u32, height: u32) -> io::Result<()> {
    let expected = width as usize * height as usize;
    if pixels.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}x{} frame needs {} bytes, got {}", width, height, expected, pixels.len()),
        ));
    }
    Ok(())
}
