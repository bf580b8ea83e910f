//! Image inspection and preview thumbnails.
//!
//! Decoding is advisory: the simulator never looks at pixels, but when an
//! upload does decode we report its dimensions and keep a small JPEG preview
//! of the latest upload under `<upload_dir>/previews/latest.jpg`.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use eyre::{Result, WrapErr};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Longest edge of a preview thumbnail, in pixels.
pub const PREVIEW_MAX_EDGE: u32 = 400;

/// JPEG quality for previews.
pub const PREVIEW_JPEG_QUALITY: u8 = 85;

/// Distinguishes concurrent in-flight preview writes.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Basic facts about a decoded upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub width: u32,
    pub height: u32,
    /// Container format, e.g. `PNG` or `JPEG`.
    pub format: Option<String>,
}

/// Decode `bytes`, returning the image and its summary.
pub fn inspect(bytes: &[u8]) -> Result<(DynamicImage, ImageSummary)> {
    let format = image::guess_format(bytes)
        .ok()
        .map(|f| format!("{:?}", f).to_uppercase());
    let img = image::load_from_memory(bytes).wrap_err("could not decode image")?;
    let summary = ImageSummary {
        width: img.width(),
        height: img.height(),
        format,
    };
    debug!(width = summary.width, height = summary.height, format = ?summary.format, "decoded upload");
    Ok((img, summary))
}

/// Downscale to fit within [`PREVIEW_MAX_EDGE`] (never upscales) and convert to RGB.
pub fn thumbnail(img: &DynamicImage) -> DynamicImage {
    let fitted = if img.width() > PREVIEW_MAX_EDGE || img.height() > PREVIEW_MAX_EDGE {
        img.thumbnail(PREVIEW_MAX_EDGE, PREVIEW_MAX_EDGE)
    } else {
        img.clone()
    };
    DynamicImage::ImageRgb8(fitted.to_rgb8())
}

/// Encode an image as a JPEG.
pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, PREVIEW_JPEG_QUALITY);
        encoder
            .encode_image(&rgb)
            .wrap_err("could not encode JPEG preview")?;
    }
    Ok(buf.into_inner())
}

/// `data:image/jpeg;base64,...` URL for a thumbnail of `img`.
pub fn thumbnail_data_url(img: &DynamicImage) -> Result<String> {
    let jpeg = encode_jpeg(&thumbnail(img))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
    Ok(format!("data:image/jpeg;base64,{}", encoded))
}

/// On-disk location for the most recent preview.
pub struct PreviewStore {
    previews_dir: PathBuf,
    enabled: bool,
}

impl PreviewStore {
    /// Open (or create) `<upload_dir>/previews`. Saving is disabled if the
    /// directory cannot be created.
    pub fn open(upload_dir: &Path) -> Self {
        let previews_dir = upload_dir.join("previews");
        let enabled = match fs::create_dir_all(&previews_dir) {
            Ok(()) => {
                info!(path = %previews_dir.display(), "preview directory ready");
                true
            }
            Err(e) => {
                warn!(path = %previews_dir.display(), error = %e, "could not create preview dir; previews disabled");
                false
            }
        };
        Self {
            previews_dir,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn latest_path(&self) -> PathBuf {
        self.previews_dir.join("latest.jpg")
    }

    /// Overwrite `latest.jpg` with a thumbnail of `img`.
    pub fn save_latest(&self, img: &DynamicImage) -> Result<PathBuf> {
        if !self.enabled {
            eyre::bail!("preview store is disabled");
        }
        let path = self.latest_path();
        let jpeg = encode_jpeg(&thumbnail(img))?;

        // Readers only ever see a complete file: write aside, then rename over.
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .previews_dir
            .join(format!(".latest.{}.{}.tmp", std::process::id(), n));
        if let Err(e) = fs::write(&tmp, &jpeg) {
            let _ = fs::remove_file(&tmp);
            return Err(e).wrap_err_with(|| format!("writing {}", tmp.display()));
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).wrap_err_with(|| format!("replacing {}", path.display()));
        }
        debug!(path = %path.display(), bytes = jpeg.len(), "preview saved");
        Ok(path)
    }
}
