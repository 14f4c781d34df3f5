use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};

/// A decoded camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// UTC Unix seconds.
    pub captured_at: i64,
}

impl Frame {
    /// Decode a received buffer. The format is sniffed from the bytes; the
    /// camera sends JPEG but anything the `image` crate reads is accepted.
    pub fn decode(data: &[u8], captured_at: i64) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Decode("image has no pixels".into()));
        }
        Ok(Self { image, captured_at })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("received an empty frame")]
    Empty,
    #[error("received bytes are not a readable image: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
