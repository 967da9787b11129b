//! Image encoding: embedded PDF image → PNG bytes.
//!
//! PDFs store images in a zoo of encodings (DCT, Flate, JBIG2, CCITT) and
//! colour spaces. pdfium decodes them to a bitmap; re-encoding every one as
//! PNG gives the image route a single content type and keeps the pixels
//! lossless.

use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Smallest edge worth keeping. Anything thinner is a rule, a bullet or a
/// spacer rather than a figure.
pub const MIN_IMAGE_EDGE: u32 = 8;

/// Stable file name for the `index`-th image on 1-based page `page`.
pub fn image_name(page: usize, index: usize) -> String {
    format!("page-{page}-img-{index}.png")
}

/// Whether a decoded image is large enough to be a figure.
pub fn is_figure(img: &DynamicImage) -> bool {
    img.width() >= MIN_IMAGE_EDGE && img.height() >= MIN_IMAGE_EDGE
}

/// Encode a decoded image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} image → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}
