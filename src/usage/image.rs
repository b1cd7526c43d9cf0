use base64::Engine;

use super::ImageUrl;

const DEFAULT_BASE_TOKENS: u64 = 85;
const DEFAULT_TILE_TOKENS: u64 = 170;
const MINI_BASE_TOKENS: u64 = 2833;
const MINI_TILE_TOKENS: u64 = 5667;
const TILE_SIZE: u32 = 512;
const SHORT_SIDE_CAP: u32 = 768;

struct TileParams {
    base_tokens: u64,
    tile_tokens: u64,
}

fn tile_params_for(model_id: &str) -> TileParams {
    if model_id.contains("gpt-4o-mini") {
        TileParams {
            base_tokens: MINI_BASE_TOKENS,
            tile_tokens: MINI_TILE_TOKENS,
        }
    } else {
        TileParams {
            base_tokens: DEFAULT_BASE_TOKENS,
            tile_tokens: DEFAULT_TILE_TOKENS,
        }
    }
}

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Estimate the token cost of one image part, following the vendor-neutral
/// geometric model: a flat per-image base cost plus a per-512px-tile cost
/// after scaling the image down to a 768px short side.
///
/// `gemini`/`claude` model ids skip decoding entirely and return a flat
/// `3 * base_tokens`, since those vendors do not expose the same tiling
/// behaviour and this crate has no authoritative formula for them.
pub async fn calculate_image_token(
    model_id: &str,
    http: &reqwest::Client,
    image: &ImageUrl,
) -> anyhow::Result<u64> {
    if image.url.is_empty() {
        return Ok(0);
    }

    let params = tile_params_for(model_id);

    let detail = image.detail.as_deref().unwrap_or("");
    if detail == "low" {
        return Ok(params.base_tokens);
    }

    if model_id.contains("gemini") || model_id.contains("claude") {
        return Ok(3 * params.base_tokens);
    }

    let bytes = fetch_image_bytes(http, &image.url).await?;
    let decoded = ::image::load_from_memory(&bytes)?;
    let (width, height) = (decoded.width(), decoded.height());

    let mut short_side = width.min(height);
    let mut other_side = width.max(height);

    if short_side > SHORT_SIDE_CAP {
        let scale = short_side as f64 / SHORT_SIDE_CAP as f64;
        other_side = (other_side as f64 / scale).ceil() as u32;
        short_side = SHORT_SIDE_CAP;
    }

    let tiles = ceil_div(short_side, TILE_SIZE) as u64 * ceil_div(other_side, TILE_SIZE) as u64;
    Ok(tiles * params.tile_tokens + params.base_tokens)
}

async fn fetch_image_bytes(http: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(rest) = url.strip_prefix("http") {
        let _ = rest; // keep both http:// and https:// matching the original substring check
        let resp = http
            .get(url)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    } else {
        // data URI (`data:image/png;base64,....`) or a bare base64 payload.
        let payload = url.split(',').next_back().unwrap_or(url);
        Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_detail_returns_flat_base_tokens() {
        assert_eq!(tile_params_for("gpt-4o").base_tokens, DEFAULT_BASE_TOKENS);
        assert_eq!(
            tile_params_for("gpt-4o-mini").base_tokens,
            MINI_BASE_TOKENS
        );
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(768, 512), 2);
        assert_eq!(ceil_div(512, 512), 1);
        assert_eq!(ceil_div(1, 512), 1);
    }

    #[tokio::test]
    async fn empty_url_costs_nothing() {
        let http = reqwest::Client::new();
        let image = ImageUrl {
            url: String::new(),
            detail: None,
        };
        let tokens = calculate_image_token("gpt-4o", &http, &image).await.unwrap();
        assert_eq!(tokens, 0);
    }

    #[tokio::test]
    async fn low_detail_skips_decoding() {
        let http = reqwest::Client::new();
        let image = ImageUrl {
            url: "https://example.com/not-fetched.png".into(),
            detail: Some("low".into()),
        };
        let tokens = calculate_image_token("gpt-4o", &http, &image).await.unwrap();
        assert_eq!(tokens, DEFAULT_BASE_TOKENS);
    }

    #[tokio::test]
    async fn gemini_models_return_flat_multiple() {
        let http = reqwest::Client::new();
        let image = ImageUrl {
            url: "https://example.com/not-fetched.png".into(),
            detail: Some("high".into()),
        };
        let tokens = calculate_image_token("gemini-1.5-pro", &http, &image)
            .await
            .unwrap();
        assert_eq!(tokens, 3 * DEFAULT_BASE_TOKENS);
    }
}
