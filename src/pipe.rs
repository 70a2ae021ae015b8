//! The pipe: what the host calls.
//!
//! Owns the configuration, the key rotator and the gateway. Each chat
//! request picks a key, forwards the converted body, and reports the
//! outcome back to the rotator. Key-attributable failures are retried on
//! a key not yet tried for this request, up to `max_attempts`.

use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, info_span, warn, Instrument};

use crate::adapters::gemini::{self, target_model, GenerateContentRequest};
use crate::adapters::{ChatGateway, ChatOutput, ChatRequest, ModelEntry};
use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use crate::pool::{KeyRotator, KeySnapshot};

/// Config and rotator, swapped together on reload.
struct PipeState {
    config: PipeConfig,
    rotator: Option<Arc<KeyRotator>>,
}

pub struct Pipe {
    state: RwLock<Arc<PipeState>>,
    gateway: Arc<dyn ChatGateway>,
}

/// Readiness summary for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipeHealth {
    pub configured: bool,
    pub missing: Vec<&'static str>,
    pub gateway: String,
    pub keys: usize,
    pub available_keys: usize,
    pub models: usize,
}

impl Pipe {
    pub fn new(config: PipeConfig, gateway: Arc<dyn ChatGateway>) -> Result<Self> {
        config.validate()?;
        let rotator = build_rotator(&config)?;
        Ok(Self {
            state: RwLock::new(Arc::new(PipeState { config, rotator })),
            gateway,
        })
    }

    fn current(&self) -> Arc<PipeState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Models offered to the host's picker.
    pub fn models(&self) -> Vec<ModelEntry> {
        self.current()
            .config
            .models()
            .into_iter()
            .map(|id| ModelEntry {
                name: id.clone(),
                id,
            })
            .collect()
    }

    /// Forward one chat request to the gateway.
    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatOutput> {
        let state = self.current();
        let missing = state.config.missing_settings();
        if !missing.is_empty() {
            return Err(PipeError::NotConfigured(format!(
                "missing {}",
                missing.join(", ")
            )));
        }
        let rotator = state
            .rotator
            .as_ref()
            .ok_or(PipeError::PoolExhausted)?;

        let model = target_model(&req.model).to_string();
        let body = gemini::build_request(req)?;
        let attempts = (state.config.max_attempts as usize).min(rotator.len()).max(1);

        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("chat", request_id = %request_id, model = %model);

        self.forward(rotator, &model, &body, attempts)
            .instrument(span)
            .await
    }

    async fn forward(
        &self,
        rotator: &KeyRotator,
        model: &str,
        body: &GenerateContentRequest,
        attempts: usize,
    ) -> Result<ChatOutput> {
        let mut last_err = None;
        let mut tried: Vec<usize> = Vec::with_capacity(attempts);
        for attempt in 1..=attempts {
            let selection = rotator.select_key();
            if tried.contains(&selection.index) {
                // No untried healthy key left for this request.
                info!(
                    key_index = selection.index,
                    attempt,
                    "Rotation returned a key already tried, giving up"
                );
                break;
            }
            tried.push(selection.index);

            match self.gateway.generate(model, body, &selection.key).await {
                Ok(resp) => {
                    rotator.record_result(&selection.key, true);
                    let out = gemini::parse_response(model, resp)?;
                    info!(
                        key_index = selection.index,
                        attempt,
                        prompt_tokens = out.usage.prompt_tokens,
                        completion_tokens = out.usage.completion_tokens,
                        "Chat completed"
                    );
                    return Ok(out);
                }
                Err(e) if e.is_key_failure() => {
                    rotator.record_result(&selection.key, false);
                    warn!(
                        key_index = selection.index,
                        attempt,
                        of = attempts,
                        "Gateway call failed: {}",
                        e
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!(key_index = selection.index, "Gateway rejected request: {}", e);
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or(PipeError::PoolExhausted))
    }

    /// Swap in a new configuration. The rotator, and with it all key
    /// health, is rebuilt only if the key list or cooldown policy
    /// changed. Gateway endpoint and headers are fixed at startup.
    pub fn reload(&self, config: PipeConfig) -> Result<()> {
        config.validate()?;
        let previous = self.current();

        if previous.config.base_url != config.base_url
            || previous.config.oe_key != config.oe_key
            || previous.config.gateway_name != config.gateway_name
            || previous.config.ai_provider != config.ai_provider
            || previous.config.timeout_secs != config.timeout_secs
        {
            warn!("Gateway settings changed; restart to apply them");
        }

        let mut wanted: Vec<String> = Vec::new();
        for key in config.keys() {
            if !wanted.contains(&key) {
                wanted.push(key);
            }
        }
        let same_keys = previous
            .rotator
            .as_ref()
            .map_or(wanted.is_empty(), |r| r.keys() == wanted.as_slice());
        let same_policy = previous.config.cooldown_policy() == config.cooldown_policy();

        let rotator = match (same_keys, same_policy) {
            (true, true) => previous.rotator.clone(),
            (false, true) => {
                info!("API keys changed, rebuilding key pool");
                build_rotator(&config)?
            }
            (true, false) => {
                info!("Cooldown policy changed, rebuilding key pool");
                build_rotator(&config)?
            }
            (false, false) => {
                info!("API keys and cooldown policy changed, rebuilding key pool");
                build_rotator(&config)?
            }
        };

        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(PipeState { config, rotator });
        Ok(())
    }

    pub fn key_status(&self) -> Vec<KeySnapshot> {
        self.current()
            .rotator
            .as_ref()
            .map(|r| r.snapshot())
            .unwrap_or_default()
    }

    pub fn health(&self) -> PipeHealth {
        let state = self.current();
        let missing = state.config.missing_settings();
        let (keys, available_keys) = state
            .rotator
            .as_ref()
            .map_or((0, 0), |r| (r.len(), r.available_count()));
        PipeHealth {
            configured: missing.is_empty(),
            missing,
            gateway: self.gateway.name().to_string(),
            keys,
            available_keys,
            models: state.config.models().len(),
        }
    }
}

fn build_rotator(config: &PipeConfig) -> Result<Option<Arc<KeyRotator>>> {
    let keys = config.keys();
    if keys.is_empty() {
        warn!("No API keys configured yet");
        return Ok(None);
    }
    Ok(Some(Arc::new(KeyRotator::new(keys, config.cooldown_policy())?)))
}
