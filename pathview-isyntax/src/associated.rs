//! Associated (label and macro) images and the embedded ICC profile.
//!
//! Unlike the tiled WSI, the associated images are plain JPEGs stored
//! base64-encoded inside the XML header. Parsing only records their file
//! spans; the bytes are fetched and decoded on demand here. The
//! compressed JPEG is always available; pixel decoding is optional (the
//! `jpeg` feature) so library users can plug in their own decoder.

use crate::Isyntax;
use crate::error::{Error, Result};
use crate::header::decode_base64_content;
use crate::image::{FileSpan, Image};

fn fetch_base64_span(isyntax: &Isyntax, span: FileSpan) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; span.len];
    isyntax
        .file
        .read_at(&mut raw, span.offset)
        .map_err(|e| Error::Open(e.into()))?;
    Ok(decode_base64_content(&raw)?)
}

/// The compressed JPEG bytes of a label or macro image.
pub(crate) fn associated_image_jpeg(isyntax: &Isyntax, image: &Image) -> Result<Vec<u8>> {
    let span = image
        .base64_jpeg
        .ok_or(Error::InvalidArgument("image carries no JPEG payload"))?;
    fetch_base64_span(isyntax, span)
}

/// The raw bytes of the embedded ICC profile. No color management is
/// applied anywhere in this crate; callers get the profile as-is.
pub(crate) fn icc_profile(isyntax: &Isyntax, image: &Image) -> Result<Vec<u8>> {
    let span = image
        .base64_icc_profile
        .ok_or(Error::InvalidArgument("image carries no ICC profile"))?;
    fetch_base64_span(isyntax, span)
}

/// Decode an associated image to interleaved RGBA pixels. Returns the
/// pixels and the image dimensions.
#[cfg(feature = "jpeg")]
pub(crate) fn associated_image_pixels(
    isyntax: &Isyntax,
    image: &Image,
) -> Result<(Vec<u8>, u32, u32)> {
    use zune_jpeg::zune_core::colorspace::ColorSpace;
    use zune_jpeg::zune_core::options::DecoderOptions;

    let jpeg = associated_image_jpeg(isyntax, image)?;
    let mut decoder = zune_jpeg::JpegDecoder::new(jpeg.as_slice());
    decoder
        .decode_headers()
        .map_err(|_| Error::InvalidArgument("associated JPEG has an invalid header"))?;
    decoder.set_options(DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA));
    let pixels = decoder
        .decode()
        .map_err(|_| Error::InvalidArgument("associated JPEG failed to decode"))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or(Error::InvalidArgument("associated JPEG has no dimensions"))?;
    Ok((pixels, width as u32, height as u32))
}
