//! EdgeOne AI Gateway adapter: Gemini `generateContent` behind the
//! EdgeOne edge proxy, authenticated with gateway headers plus a
//! per-request API key.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::time::Instant;
use tracing::debug;

use super::gemini::{GenerateContentRequest, GenerateContentResponse};
use super::ChatGateway;
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};

const OE_KEY: HeaderName = HeaderName::from_static("oe-key");
const OE_GATEWAY_NAME: HeaderName = HeaderName::from_static("oe-gateway-name");
const OE_AI_PROVIDER: HeaderName = HeaderName::from_static("oe-ai-provider");

pub struct EdgeOneGateway {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl EdgeOneGateway {
    pub fn new(config: &PipeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers: gateway_headers(config)?,
        })
    }

    /// Endpoint for a model. The key goes in the query string.
    pub fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }
}

fn gateway_headers(config: &PipeConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in [
        (OE_KEY, &config.oe_key),
        (OE_GATEWAY_NAME, &config.gateway_name),
        (OE_AI_PROVIDER, &config.ai_provider),
    ] {
        let mut value = HeaderValue::from_str(value.trim()).map_err(|_| {
            PipeError::InvalidConfig(format!("{} is not a valid header value", name))
        })?;
        if name == OE_KEY {
            value.set_sensitive(true);
        }
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl ChatGateway for EdgeOneGateway {
    fn name(&self) -> &str {
        "edgeone"
    }

    async fn generate(
        &self,
        model: &str,
        body: &GenerateContentRequest,
        key: &str,
    ) -> Result<GenerateContentResponse> {
        let start = Instant::now();
        let resp = self
            .client
            .post(self.endpoint(model))
            .headers(self.headers.clone())
            .query(&[("key", key)])
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        debug!(
            model = %model,
            status,
            latency_ms = start.elapsed().as_millis() as u64,
            "Gateway responded"
        );

        if !resp.status().is_success() {
            let err_body = resp.text().await.unwrap_or_default();
            return Err(PipeError::upstream(status, &err_body));
        }

        let parsed = resp.json::<GenerateContentResponse>().await?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipeConfig {
        PipeConfig {
            base_url: "https://gw.example.com/v1/".into(),
            oe_key: "oe-secret".into(),
            gateway_name: "my-gateway".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint() {
        let gw = EdgeOneGateway::new(&config()).unwrap();
        assert_eq!(
            gw.endpoint("gemini-2.5-flash"),
            "https://gw.example.com/v1/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn test_gateway_headers() {
        let headers = gateway_headers(&config()).unwrap();
        assert_eq!(headers["oe-key"], "oe-secret");
        assert!(headers["oe-key"].is_sensitive());
        assert_eq!(headers["oe-gateway-name"], "my-gateway");
        assert_eq!(headers["oe-ai-provider"], "gemini");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let bad = PipeConfig {
            gateway_name: "line\nbreak".into(),
            ..config()
        };
        assert!(matches!(
            gateway_headers(&bad),
            Err(PipeError::InvalidConfig(_))
        ));
    }
}
