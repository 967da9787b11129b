//! PDF extraction: page text and embedded images via pdfium.
//!
//! pdfium is a C++ library with process-global state; every call runs inside
//! `tokio::task::spawn_blocking` so CPU-heavy parsing never stalls the async
//! workers. The blocking task owns the [`Downloaded`] file, so the temp
//! directory outlives the parse even if the caller stops waiting for it.

use crate::error::ConversionFailure;
use crate::pipeline::download::Downloaded;
use crate::pipeline::encode::{encode_png, image_name, is_figure};
use crate::store::ImageBlob;
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

/// Raw extraction output, before cleanup.
#[derive(Debug, Default)]
pub struct Extracted {
    pub markdown: String,
    pub images: Vec<ImageBlob>,
    pub page_count: usize,
}

/// Extract every page of a downloaded PDF.
pub async fn extract(pdf: Downloaded) -> Result<Extracted, ConversionFailure> {
    tokio::task::spawn_blocking(move || {
        let pdfium = pdfium_auto::bind_pdfium_silent()
            .map_err(|e| ConversionFailure::internal(format!("PDF engine unavailable: {e}")))?;
        extract_blocking(&pdfium, &pdf)
    })
    .await
    .map_err(|e| ConversionFailure::internal(format!("Extraction task panicked: {e}")))?
}

fn extract_blocking(pdfium: &Pdfium, pdf: &Downloaded) -> Result<Extracted, ConversionFailure> {
    let document = pdfium.load_pdf_from_file(pdf.path(), None).map_err(|e| {
        debug!("pdfium rejected {}: {:?}", pdf.path().display(), e);
        ConversionFailure::invalid_pdf()
    })?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    info!("PDF loaded: {} pages", page_count);

    let mut out = Extracted {
        page_count,
        ..Extracted::default()
    };
    let mut sections = Vec::with_capacity(page_count);

    for (idx, page) in pages.iter().enumerate() {
        let page_num = idx + 1;
        let mut section = match page.text() {
            Ok(text) => text.all(),
            Err(e) => {
                warn!("Page {}: text extraction failed: {:?}", page_num, e);
                String::new()
            }
        };

        let mut img_idx = 0;
        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            let decoded = match image_object.get_raw_image() {
                Ok(img) => img,
                Err(e) => {
                    warn!("Page {}: skipping undecodable image: {:?}", page_num, e);
                    continue;
                }
            };
            if !is_figure(&decoded) {
                continue;
            }
            match encode_png(&decoded) {
                Ok(bytes) => {
                    let name = image_name(page_num, img_idx);
                    img_idx += 1;
                    section.push_str(&format!("\n\n![]({name})\n"));
                    out.images.push(ImageBlob::new(name, bytes));
                }
                Err(e) => warn!("Page {}: PNG encoding failed: {}", page_num, e),
            }
        }

        debug!(
            "Page {} → {} chars, {} images",
            page_num,
            section.len(),
            img_idx
        );
        sections.push(section);
    }

    out.markdown = sections.join("\n\n");
    Ok(out)
}
