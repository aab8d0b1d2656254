// ============================================================================
// AI OPERATIONS: remote inpainting service client
// ============================================================================
//
// Request:  POST {endpoint}  JSON { image: <base64 PNG>, mask: <base64 PNG> }
//           mask is 8-bit grey, white = inpaint, black = keep.
// Response: 200 { imageUrl, remaining }   (imageUrl: data: URL or http(s) URL)
//           429 rate limited (daily quota spent) with a user-facing message
//           503 service not configured
// Anything else is a generic failure; the caller falls back to local filling.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ColorType, GrayImage, ImageEncoder, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use super::region_fill::FillReport;
use super::stroke_mask::Mask;

/// Errors from the remote inpainting service. None of them are fatal to a
/// commit; the orchestrator routes around every variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Daily quota spent on the server side. Carries the user-facing message.
    RateLimited(String),
    /// The service is reachable but has no backend configured.
    NotConfigured,
    Timeout,
    Network(String),
    Http(u16),
    Malformed(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::RateLimited(msg) => write!(f, "Remote inpainting rate limited: {}", msg),
            RemoteError::NotConfigured => write!(f, "Remote inpainting service is not configured"),
            RemoteError::Timeout => write!(f, "Remote inpainting timed out"),
            RemoteError::Network(e) => write!(f, "Remote inpainting network error: {}", e),
            RemoteError::Http(status) => write!(f, "Remote inpainting failed with HTTP {}", status),
            RemoteError::Malformed(e) => write!(f, "Malformed remote inpainting response: {}", e),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Successful remote result.
#[derive(Clone, Debug)]
pub struct RemoteInpaint {
    pub image: RgbaImage,
    /// Calls left today according to the server.
    pub remaining: u32,
}

/// A remote inpainting backend. Implementations block; the orchestrator owns
/// the time box and runs calls on a worker thread.
pub trait InpaintClient: Send + Sync {
    fn inpaint(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RemoteInpaint, RemoteError>;
}

// -- Wire types ------------------------------------------------------------------

#[derive(Serialize)]
struct InpaintRequestBody<'a> {
    image: &'a str,
    mask: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InpaintResponseBody {
    image_url: String,
    remaining: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// -- HTTP client -------------------------------------------------------------------

/// Blocking HTTP implementation of [`InpaintClient`].
pub struct HttpInpaintClient {
    endpoint: String,
    http: reqwest::blocking::Client,
}

impl HttpInpaintClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_reqwest)?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        if url.starts_with("data:") {
            return decode_data_url(url);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RemoteError::Malformed(format!("unsupported image URL '{}'", url)));
        }
        let resp = self.http.get(url).send().map_err(map_reqwest)?;
        if !resp.status().is_success() {
            return Err(RemoteError::Http(resp.status().as_u16()));
        }
        Ok(resp.bytes().map_err(map_reqwest)?.to_vec())
    }
}

impl InpaintClient for HttpInpaintClient {
    fn inpaint(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RemoteInpaint, RemoteError> {
        let image_b64 = encode_png_base64(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)?;
        let mask_b64 = encode_png_base64(mask.as_raw(), mask.width(), mask.height(), ColorType::L8)?;
        let body = InpaintRequestBody {
            image: &image_b64,
            mask: &mask_b64,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(map_reqwest)?;

        let status = resp.status();
        match status.as_u16() {
            429 => {
                let message = resp
                    .text()
                    .ok()
                    .and_then(|t| error_message(&t))
                    .unwrap_or_else(|| "Daily AI removal limit reached".to_string());
                return Err(RemoteError::RateLimited(message));
            }
            503 => return Err(RemoteError::NotConfigured),
            code if !status.is_success() => return Err(RemoteError::Http(code)),
            _ => {}
        }

        let parsed: InpaintResponseBody = resp
            .json()
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let bytes = self.fetch_image(&parsed.image_url)?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| RemoteError::Malformed(e.to_string()))?
            .to_rgba8();

        Ok(RemoteInpaint {
            image,
            remaining: parsed.remaining,
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.message.or(parsed.error).filter(|m| !m.trim().is_empty())
}

// -- Encoding helpers ----------------------------------------------------------------

/// PNG-encode a raw buffer and base64 it.
pub fn encode_png_base64(raw: &[u8], width: u32, height: u32, color: ColorType) -> Result<String, RemoteError> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(raw, width, height, color)
        .map_err(|e| RemoteError::Malformed(format!("PNG encode failed: {}", e)))?;
    Ok(BASE64.encode(png))
}

/// Decode a `data:<mime>;base64,<payload>` URL into bytes.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, RemoteError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| RemoteError::Malformed("not a data URL".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| RemoteError::Malformed("data URL has no payload".into()))?;
    if !header.ends_with(";base64") {
        return Err(RemoteError::Malformed("data URL is not base64".into()));
    }
    BASE64
        .decode(payload.trim())
        .map_err(|e| RemoteError::Malformed(e.to_string()))
}

/// Blend a remote result into `target` inside the mask only, weighted by
/// `weight × opacity`. The result is resized to the target if needed.
pub fn composite_result(target: &mut RgbaImage, result: &RgbaImage, mask: &Mask, opacity: f32) -> FillReport {
    let (w, h) = target.dimensions();
    let resized;
    let result = if result.dimensions() != (w, h) {
        resized = image::imageops::resize(result, w, h, FilterType::Triangle);
        &resized
    } else {
        result
    };

    let opacity = opacity.clamp(0.0, 1.0);
    let mut report = FillReport::default();
    for (x, y, weight) in mask.iter() {
        if x < 0 || y < 0 || x >= w as i32 || y >= h as i32 {
            report.skipped += 1;
            continue;
        }
        let t = weight * opacity;
        let tp = target.get_pixel(x as u32, y as u32);
        let sp = result.get_pixel(x as u32, y as u32);
        let mut px = [0u8; 4];
        for c in 0..4 {
            px[c] = (tp.0[c] as f32 + (sp.0[c] as f32 - tp.0[c] as f32) * t)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
        target.put_pixel(x as u32, y as u32, Rgba(px));
        report.filled += 1;
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::stroke_mask::MaskRect;

    #[test]
    fn data_url_payload_decodes_to_png() {
        let img = RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255]));
        let b64 = encode_png_base64(img.as_raw(), 3, 2, ColorType::Rgba8).unwrap();
        let bytes = decode_data_url(&format!("data:image/png;base64,{}", b64)).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded, img);
    }

    #[test]
    fn non_base64_data_urls_are_malformed() {
        assert!(matches!(decode_data_url("data:text/plain,hello"), Err(RemoteError::Malformed(_))));
        assert!(matches!(decode_data_url("https://x/y.png"), Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn composite_only_touches_masked_pixels() {
        let mut target = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let result = RgbaImage::from_pixel(10, 10, Rgba([200, 100, 50, 255]));
        let mask = Mask::from_weights(MaskRect::new(2, 2, 2, 1), vec![1.0, 0.5]).unwrap();
        let report = composite_result(&mut target, &result, &mask, 1.0);

        assert_eq!(report.filled, 2);
        assert_eq!(target.get_pixel(2, 2), &Rgba([200, 100, 50, 255]));
        assert_eq!(target.get_pixel(3, 2), &Rgba([100, 50, 25, 255]));
        assert_eq!(target.get_pixel(4, 2), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn error_messages_prefer_message_field() {
        assert_eq!(
            error_message(r#"{"error":"rate_limited","message":"Come back tomorrow"}"#).as_deref(),
            Some("Come back tomorrow")
        );
        assert_eq!(error_message("not json"), None);
    }
}
