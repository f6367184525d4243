//! Pairing code rendering

use base64::{Engine, engine::general_purpose::STANDARD};
use qrcode::{QrCode, render::svg};

use crate::error::DeviceError;
use crate::models::PairingPayload;

const MIN_IMAGE_SIZE: u32 = 256;

/// Render a raw pairing string as a scannable SVG data URL
pub fn render(code: &str) -> Result<PairingPayload, DeviceError> {
    let qr = QrCode::new(code.as_bytes()).map_err(|e| DeviceError::Pairing(e.to_string()))?;
    let image = qr
        .render::<svg::Color<'_>>()
        .min_dimensions(MIN_IMAGE_SIZE, MIN_IMAGE_SIZE)
        .build();

    Ok(PairingPayload {
        code: code.to_string(),
        image_data_url: format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)),
    })
}
