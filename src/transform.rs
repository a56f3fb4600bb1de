use crate::config::SupportedFormat;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::io;
use thiserror::Error;

/// Raw source bytes, as read from disk.
pub type SourceStream = BoxStream<'static, io::Result<Bytes>>;

/// Transcoded output, chunk by chunk.
pub type EncodedStream = BoxStream<'static, Result<Bytes, EncodeError>>;

/// Size of the chunks [`RasterEncoder`] emits.
pub const OUTPUT_CHUNK: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum EncodeError {
    /// Reading the source failed; the image itself may be fine.
    #[error("Source read failed: {0}")]
    Source(#[source] io::Error),
    #[error("Transcode failed: {0}")]
    Codec(String),
    #[error("Encoder timed out")]
    Timeout,
}

impl Clone for EncodeError {
    fn clone(&self) -> Self {
        match self {
            EncodeError::Source(e) => EncodeError::Source(io::Error::new(e.kind(), e.to_string())),
            EncodeError::Codec(msg) => EncodeError::Codec(msg.clone()),
            EncodeError::Timeout => EncodeError::Timeout,
        }
    }
}

/// The transcoding capability the proxy is built around.
///
/// Implementations consume the source incrementally and yield output as it
/// becomes available. Errors reading `source` must surface as
/// [`EncodeError::Source`] so they stay distinguishable from codec failures.
#[async_trait::async_trait]
pub trait Encoder: Send + Sync + 'static {
    async fn encode(&self, source: SourceStream, format: SupportedFormat) -> Result<EncodedStream, EncodeError>;
}

/// Production encoder backed by the `image` and `webp` crates.
///
/// Raster codecs need the whole picture, so the source is buffered (up to
/// `max_input_size`) and the encode runs on the blocking pool; only the
/// output side is streamed.
#[derive(Debug, Clone)]
pub struct RasterEncoder {
    quality: u8,
    max_input_size: usize,
}

impl RasterEncoder {
    pub fn new(quality: u8, max_input_size: usize) -> Self {
        Self { quality, max_input_size }
    }
}

#[async_trait::async_trait]
impl Encoder for RasterEncoder {
    async fn encode(&self, mut source: SourceStream, format: SupportedFormat) -> Result<EncodedStream, EncodeError> {
        let mut buf = BytesMut::with_capacity(8192);
        while let Some(chunk) = source.next().await.transpose().map_err(EncodeError::Source)? {
            if buf.len() + chunk.len() > self.max_input_size {
                return Err(EncodeError::Codec("Input exceeds size limit".into()));
            }
            buf.extend_from_slice(&chunk);
        }

        let quality = self.quality;
        let encoded = tokio::task::spawn_blocking(move || {
            let img = decode_image(&buf)?;
            encode_image(&img, format, quality)
        })
        .await
        .map_err(codec_error)??;

        Ok(stream::iter(chunked(Bytes::from(encoded)).into_iter().map(Ok)).boxed())
    }
}

fn chunked(mut out: Bytes) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(out.len() / OUTPUT_CHUNK + 1);
    while !out.is_empty() {
        let n = out.len().min(OUTPUT_CHUNK);
        chunks.push(out.split_to(n));
    }
    chunks
}

/// Decodes a source of any enabled input format, sniffed from its magic bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, EncodeError> {
    let guessed = image::guess_format(bytes).map_err(codec_error)?;
    image::load_from_memory_with_format(bytes, guessed).map_err(codec_error)
}

fn codec_error(e: impl std::fmt::Display) -> EncodeError {
    EncodeError::Codec(e.to_string())
}

/// Encodes `img` as `format`. `quality` is clamped to 1..=100.
pub fn encode_image(img: &DynamicImage, format: SupportedFormat, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let quality = quality.clamp(1, 100);
    match format {
        SupportedFormat::Jpeg => encode_jpeg(img, quality),
        SupportedFormat::Webp => Ok(encode_webp(img, quality)),
        SupportedFormat::Avif => encode_avif(img, quality),
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(codec_error)?;
    Ok(out)
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Vec<u8> {
    let rgb = img.to_rgb8();
    webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
        .encode(f32::from(quality))
        .to_vec()
}

/// Keeps alpha; speed 4 of 10.
fn encode_avif(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let rgba = img.to_rgba8();
    let mut out = Vec::new();
    AvifEncoder::new_with_speed_quality(&mut out, 4, quality)
        .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
        .map_err(codec_error)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_preserves_bytes() {
        let data: Vec<u8> = (0..(OUTPUT_CHUNK * 2 + 10)).map(|i| i as u8).collect();
        let chunks = chunked(Bytes::from(data.clone()));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 10);
        assert_eq!(chunks.concat(), data);
        assert!(chunked(Bytes::new()).is_empty());
    }
}
