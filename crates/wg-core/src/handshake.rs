//! QR rendering for the chat client's linking handshake.

use std::path::Path;

use image::Luma;
use qrcode::{render::unicode, QrCode};

use crate::{errors::Error, Result};

/// Caption sent with the QR image. The window is advisory; the client decides
/// when a code actually expires.
pub const HANDSHAKE_CAPTION: &str = "Scan this QR code within 20 seconds...";

const MIN_IMAGE_PX: u32 = 400;

fn encode(payload: &str) -> Result<QrCode> {
    QrCode::new(payload.as_bytes())
        .map_err(|e| Error::External(format!("qr encode failed: {e}")))
}

/// Write the payload as a PNG QR code at `path`.
pub fn render_png(payload: &str, path: &Path) -> Result<()> {
    let code = encode(payload)?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(MIN_IMAGE_PX, MIN_IMAGE_PX)
        .build();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| Error::External(format!("qr image write failed: {e}")))
}

/// Compact half-block rendering for terminals (console fallback).
pub fn render_terminal(payload: &str) -> Result<String> {
    let code = encode(payload)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
