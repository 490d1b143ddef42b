//! QR code rendering for pairing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use wagate_core::error::GatewayError;

/// Render a QR code as PNG image bytes.
pub fn generate_qr_image(qr_data: &str) -> Result<Vec<u8>, GatewayError> {
    use image::{ImageBuffer, Luma};
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(qr_data.as_bytes(), EcLevel::L)
        .map_err(|e| GatewayError::Library(format!("QR generation failed: {e}")))?;

    let module_size: u32 = 8;
    let quiet_zone: u32 = 4;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let (cx, cy) = (x / module_size, y / module_size);
        let inside = cx >= quiet_zone
            && cy >= quiet_zone
            && cx - quiet_zone < modules
            && cy - quiet_zone < modules;
        if !inside {
            return Luma([255u8]);
        }
        match code[((cx - quiet_zone) as usize, (cy - quiet_zone) as usize)] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::Library(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}

/// Render a QR code as a `data:image/png;base64,` URL.
pub fn qr_data_url(qr_data: &str) -> Result<String, GatewayError> {
    let png = generate_qr_image(qr_data)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}
