//! Conversion between `data:` URIs and in-memory images

use crate::config::{ALLOWED_IMAGE_TYPES, DATA_URI_PREFIX, PREVIEW_JPEG_QUALITY};
use crate::error::{PipelineError, ValidationError};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use std::io::Cursor;

/// Header and payload of a data URI, borrowed from the request body
#[derive(Debug, PartialEq, Eq)]
struct DataUri<'a> {
    mime: &'a str,
    payload: &'a str,
}

/// Split `data:<mime>;base64,<payload>` into its parts
fn parse_data_uri(input: &str) -> Result<DataUri<'_>, ValidationError> {
    if input.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !input.starts_with(DATA_URI_PREFIX) {
        return Err(ValidationError::MissingPrefix);
    }

    let (header, payload) = input.split_once(',').ok_or_else(|| {
        ValidationError::MalformedHeader("missing `,` between header and payload".into())
    })?;

    // "data:" is guaranteed by the prefix check
    let header = &header["data:".len()..];
    let (params, encoding) = header.rsplit_once(';').ok_or_else(|| {
        ValidationError::MalformedHeader(format!("expected `;base64` after `{header}`"))
    })?;
    let mime = params.split(';').next().unwrap_or(params);
    if encoding != "base64" {
        return Err(ValidationError::MalformedHeader(format!(
            "unsupported encoding `{encoding}`"
        )));
    }

    let mime_lower = mime.to_ascii_lowercase();
    if !ALLOWED_IMAGE_TYPES.contains(&mime_lower.as_str()) {
        return Err(ValidationError::UnsupportedType(mime.to_string()));
    }

    Ok(DataUri { mime, payload })
}

/// Decode and validate a base64 image data URI.
///
/// Fails with a `ValidationError` for a missing prefix, a malformed header, a
/// MIME type outside the allowed set, invalid base64, an empty payload or
/// bytes that are not an image.
pub fn decode_data_uri(input: &str) -> Result<DynamicImage, ValidationError> {
    let uri = parse_data_uri(input)?;

    // Browsers sometimes wrap long payloads
    let payload: String = uri
        .payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = general_purpose::STANDARD.decode(payload)?;
    if bytes.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    let image = image::load_from_memory(&bytes).map_err(ValidationError::Undecodable)?;
    tracing::debug!(
        mime = uri.mime,
        bytes = bytes.len(),
        width = image.width(),
        height = image.height(),
        "decoded input image"
    );
    Ok(image)
}

/// Encode an RGB image as a JPEG data URI for direct display by the caller
pub fn encode_jpeg_data_uri(image: &RgbImage) -> Result<String, PipelineError> {
    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), PREVIEW_JPEG_QUALITY);
    image
        .write_with_encoder(encoder)
        .map_err(PipelineError::Encode)?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(jpeg)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test;
    use image::{DynamicImage, ImageFormat};

    #[test]
    fn test_missing_prefix() {
        let err = decode_data_uri("not-an-image").unwrap_err();
        assert!(matches!(err, ValidationError::MissingPrefix));
        assert!(err.to_string().contains("data:image/"));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            decode_data_uri("").unwrap_err(),
            ValidationError::Empty
        ));
    }

    #[test]
    fn test_gif_is_rejected() {
        let err = decode_data_uri("data:image/gif;base64,R0lGODlhAQABAAAAACw=").unwrap_err();
        match &err {
            ValidationError::UnsupportedType(mime) => assert_eq!(mime, "image/gif"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("image/gif"));
    }

    #[test]
    fn test_malformed_headers() {
        assert!(matches!(
            decode_data_uri("data:image/png;base64").unwrap_err(),
            ValidationError::MalformedHeader(_)
        ));
        assert!(matches!(
            decode_data_uri("data:image/png,AAAA").unwrap_err(),
            ValidationError::MalformedHeader(_)
        ));
        assert!(matches!(
            decode_data_uri("data:image/png;utf8,AAAA").unwrap_err(),
            ValidationError::MalformedHeader(_)
        ));
    }

    #[test]
    fn test_bad_payloads() {
        assert!(matches!(
            decode_data_uri("data:image/png;base64,").unwrap_err(),
            ValidationError::EmptyPayload
        ));
        assert!(matches!(
            decode_data_uri("data:image/png;base64,%%%%").unwrap_err(),
            ValidationError::InvalidBase64(_)
        ));
        // valid base64, but not an image
        assert!(matches!(
            decode_data_uri("data:image/png;base64,aGVsbG8gd29ybGQ=").unwrap_err(),
            ValidationError::Undecodable(_)
        ));
    }

    #[test]
    fn test_decode_png_and_jpeg() {
        let png = test::png_data_uri(50, 40);
        let image = decode_data_uri(&png).unwrap();
        assert_eq!((image.width(), image.height()), (50, 40));

        let jpeg = test::data_uri(
            DynamicImage::ImageRgb8(test::sample_photo(30, 20)),
            ImageFormat::Jpeg,
            "image/jpg",
        );
        let image = decode_data_uri(&jpeg).unwrap();
        assert_eq!((image.width(), image.height()), (30, 20));
    }

    #[test]
    fn test_decode_webp() {
        let photo = test::sample_photo(12, 9);
        let webp = test::data_uri(
            DynamicImage::ImageRgb8(photo.clone()),
            ImageFormat::WebP,
            "image/webp",
        );
        let image = decode_data_uri(&webp).unwrap();
        assert_eq!((image.width(), image.height()), (12, 9));
        // the encoder is lossless
        assert_eq!(image.to_rgb8(), photo);
    }

    #[test]
    fn test_payload_whitespace_is_ignored() {
        let png = test::png_data_uri(8, 8);
        let (header, payload) = png.split_once(',').unwrap();
        let (a, b) = payload.split_at(payload.len() / 2);
        let wrapped = format!("{header},{a}\n{b}");
        assert!(decode_data_uri(&wrapped).is_ok());
    }

    #[test]
    fn test_encode_preview() {
        let preview = encode_jpeg_data_uri(&test::sample_photo(224, 224)).unwrap();
        assert!(preview.starts_with("data:image/jpeg;base64,"));

        let decoded = decode_data_uri(&preview).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (224, 224));
    }
}
