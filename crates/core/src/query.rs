//! Cached queries with malformed-response recovery
//!
//! The single-shot query path: consult the response cache, call the
//! provider, store good responses. Malformed responses (empty text, bad
//! JSON) are retried with a cache-busting prefix so provider-side caching
//! cannot return the same bad output, and bad local cache entries are
//! deleted so future runs hit only verified responses. When the primary
//! model is configured with fallbacks, each fallback gets its own retry
//! budget after the primary fails.

use std::path::Path;

use rand::Rng;
use serde_json::Value;

use crate::cache::ApiCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, MessageRequest, Provider};
use crate::runlog::{LogEntry, RunLog};

/// How a response is validated before acceptance.
#[derive(Clone, Copy, Debug)]
pub enum ResponseFormat<'a> {
    /// Any non-empty text is acceptable
    Text,
    /// The response must parse as JSON; when keys are given, the top level
    /// must be an object containing all of them
    Json { expected_keys: &'a [&'a str] },
}

/// Run-scoped context threaded through the analysis layers: response cache,
/// interaction log, and provider factory for fallback models.
pub struct LlmSession {
    pub config: Config,
    cache: ApiCache,
    run_log: RunLog,
    factory: Box<dyn ProviderFactory>,
}

/// Creates providers by registry name. Abstracted so tests can swap in
/// scripted providers without touching the environment.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &Config, model_name: &str) -> Result<Box<dyn Provider>>;
}

/// Factory backed by `llm::create_provider` (API keys from the environment).
pub struct EnvProviderFactory;

impl ProviderFactory for EnvProviderFactory {
    fn create(&self, config: &Config, model_name: &str) -> Result<Box<dyn Provider>> {
        crate::llm::create_provider(config, model_name)
    }
}

fn cache_bust_prefix(format: ResponseFormat<'_>) -> String {
    let request_id: u32 = rand::rng().random_range(100_000..1_000_000);
    let instruction = match format {
        ResponseFormat::Text => "Please ensure your response is properly formatted",
        ResponseFormat::Json { .. } => "Please ensure your response is properly formatted JSON",
    };
    format!("[Request ID: {request_id} - {instruction}]\n\n")
}

/// Pull a JSON value out of model output: direct parse first, then inside
/// markdown fences, then the widest brace/bracket-delimited span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Validate a raw response. Returns the failure reason when the response is
/// unusable.
fn validate_response(raw: &str, format: ResponseFormat<'_>) -> std::result::Result<(), String> {
    if raw.trim().is_empty() {
        return Err("empty_response".to_string());
    }
    let ResponseFormat::Json { expected_keys } = format else {
        return Ok(());
    };

    let Some(value) = extract_json(raw) else {
        return Err("json_parse_error".to_string());
    };

    if expected_keys.is_empty() {
        return Ok(());
    }
    match value {
        Value::Object(map) => {
            let missing: Vec<&&str> = expected_keys
                .iter()
                .filter(|k| !map.contains_key(**k))
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("missing_required_keys: {missing:?}"))
            }
        }
        other => Err(format!(
            "expected_object_with_keys_{expected_keys:?}_but_got_{}",
            json_type_name(&other)
        )),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl LlmSession {
    /// Open the run-scoped context: response cache at
    /// `<output>/api_cache.json` and a fresh `logNNNN.json`.
    pub fn new(config: Config, output_dir: &Path) -> Result<Self> {
        Self::with_factory(config, output_dir, Box::new(EnvProviderFactory))
    }

    pub fn with_factory(
        config: Config,
        output_dir: &Path,
        factory: Box<dyn ProviderFactory>,
    ) -> Result<Self> {
        let cache = ApiCache::open(&output_dir.join("api_cache.json"), None)?;
        let run_log = RunLog::create(output_dir)?;
        Ok(Self {
            config,
            cache,
            run_log,
            factory,
        })
    }

    pub fn create_provider(&self, model_name: &str) -> Result<Box<dyn Provider>> {
        self.factory.create(&self.config, model_name)
    }

    /// One cached call: cache lookup, provider call on miss, store when
    /// non-empty, log either way. Returns the raw text and whether it was a
    /// cache hit.
    async fn query_once(
        &mut self,
        provider: &dyn Provider,
        system: &str,
        cache_blocks: &[String],
        prompt: &str,
        max_tokens: u32,
    ) -> Result<(String, bool)> {
        let stable: String = cache_blocks.concat();
        let model = provider.name().to_string();

        if let Some(cached) = self.cache.get(&stable, prompt, &model, max_tokens)? {
            self.run_log.append(&LogEntry {
                timestamp: chrono::Utc::now().to_rfc3339(),
                model: &model,
                cached: Some("CACHED"),
                stable_prompt: &stable,
                query_prompt: prompt,
                response: &cached,
                cache_created: 0,
                cache_read: 0,
            })?;
            return Ok((cached, true));
        }

        let request = MessageRequest {
            system: system.to_string(),
            cache_blocks: cache_blocks.to_vec(),
            messages: vec![ChatMessage::User(prompt.to_string())],
            tools: Vec::new(),
            max_tokens,
        };
        let response = provider.create_message(&request).await?;

        // Empty responses indicate failures that need retry; never cache them
        if !response.text.trim().is_empty() {
            self.cache
                .insert(&stable, prompt, &model, max_tokens, &response.text)?;
        }

        self.run_log.append(&LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: &model,
            cached: None,
            stable_prompt: &stable,
            query_prompt: prompt,
            response: &response.text,
            cache_created: response.cache_created,
            cache_read: response.cache_read,
        })?;

        Ok((response.text, false))
    }

    /// Query for plain text with malformed-response recovery and model
    /// fallback. `task` selects the fallback chain from the config.
    pub async fn query_text(
        &mut self,
        provider: &dyn Provider,
        system: &str,
        cache_blocks: &[String],
        prompt: &str,
        max_tokens: u32,
        task: &str,
    ) -> Result<String> {
        self.query_validated(
            provider,
            system,
            cache_blocks,
            prompt,
            max_tokens,
            task,
            ResponseFormat::Text,
        )
        .await
    }

    /// Query for JSON. The returned value is the extracted JSON.
    pub async fn query_json(
        &mut self,
        provider: &dyn Provider,
        system: &str,
        cache_blocks: &[String],
        prompt: &str,
        max_tokens: u32,
        task: &str,
        expected_keys: &[&str],
    ) -> Result<Value> {
        let raw = self
            .query_validated(
                provider,
                system,
                cache_blocks,
                prompt,
                max_tokens,
                task,
                ResponseFormat::Json { expected_keys },
            )
            .await?;
        extract_json(&raw).ok_or_else(|| Error::Model {
            reason: "validated response no longer parses as JSON".to_string(),
            attempts: 1,
            fallbacks: Vec::new(),
        })
    }

    async fn query_validated(
        &mut self,
        provider: &dyn Provider,
        system: &str,
        cache_blocks: &[String],
        prompt: &str,
        max_tokens: u32,
        task: &str,
        format: ResponseFormat<'_>,
    ) -> Result<String> {
        let max_tokens = if max_tokens > 0 {
            max_tokens
        } else {
            provider.default_max_tokens()
        };
        let stable: String = cache_blocks.concat();
        let fallbacks: Vec<String> = self.config.fallback_models(task).to_vec();
        let retries_per_model = self.config.max_retries_per_model();
        // With fallbacks configured the primary gets a single attempt;
        // escalation is cheaper than hammering a model that just failed.
        let primary_attempts = if fallbacks.is_empty() {
            retries_per_model
        } else {
            1
        };

        // (model name, prompt variant) pairs whose cache entries must not
        // survive this call
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut total_attempts = 0u32;
        let mut last_reason = String::new();

        match self
            .attempt_model(
                provider,
                system,
                cache_blocks,
                &stable,
                prompt,
                max_tokens,
                primary_attempts,
                format,
                &mut failed,
                &mut total_attempts,
                &mut last_reason,
            )
            .await?
        {
            Some(response) => {
                self.finish_success(&stable, prompt, provider.name(), max_tokens, &response, &failed)?;
                return Ok(response);
            }
            None => {}
        }

        let mut fallbacks_tried = Vec::new();
        for fallback_name in &fallbacks {
            println!(
                "    Primary model '{}' failed; trying fallback model: {fallback_name}",
                provider.name()
            );
            fallbacks_tried.push(fallback_name.clone());

            let fallback = match self.factory.create(&self.config, fallback_name) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(model = fallback_name.as_str(), error = %e, "failed to create fallback provider");
                    continue;
                }
            };

            match self
                .attempt_model(
                    fallback.as_ref(),
                    system,
                    cache_blocks,
                    &stable,
                    prompt,
                    max_tokens,
                    retries_per_model,
                    format,
                    &mut failed,
                    &mut total_attempts,
                    &mut last_reason,
                )
                .await?
            {
                Some(response) => {
                    println!(
                        "    Fallback model '{fallback_name}' succeeded; response stored under original prompt key"
                    );
                    self.finish_success(
                        &stable,
                        prompt,
                        fallback.name(),
                        max_tokens,
                        &response,
                        &failed,
                    )?;
                    return Ok(response);
                }
                None => continue,
            }
        }

        // Exhausted: leave no bad entries behind
        for (model, variant) in &failed {
            self.cache.remove(&stable, variant, model, max_tokens)?;
        }
        Err(Error::Model {
            reason: last_reason,
            attempts: total_attempts,
            fallbacks: fallbacks_tried,
        })
    }

    /// Run the retry loop for one model. Returns the accepted response, or
    /// `None` when the budget is exhausted. Transport errors that survive
    /// the provider's own retries are recorded and treated like malformed
    /// attempts so fallbacks still get their turn.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_model(
        &mut self,
        provider: &dyn Provider,
        system: &str,
        cache_blocks: &[String],
        stable: &str,
        prompt: &str,
        max_tokens: u32,
        attempts: u32,
        format: ResponseFormat<'_>,
        failed: &mut Vec<(String, String)>,
        total_attempts: &mut u32,
        last_reason: &mut String,
    ) -> Result<Option<String>> {
        for attempt in 0..attempts {
            let current_prompt = if attempt == 0 {
                prompt.to_string()
            } else {
                let busted = format!("{}{prompt}", cache_bust_prefix(format));
                println!(
                    "    WARNING: retrying query (attempt {}/{attempts}) with cache-busting variation",
                    attempt + 1
                );
                busted
            };
            *total_attempts += 1;

            let outcome = self
                .query_once(provider, system, cache_blocks, &current_prompt, max_tokens)
                .await;

            let raw = match outcome {
                Ok((raw, _cached)) => raw,
                Err(e) => {
                    *last_reason = format!("api_error: {e}");
                    failed.push((provider.name().to_string(), current_prompt));
                    continue;
                }
            };

            match validate_response(&raw, format) {
                Ok(()) => {
                    if attempt > 0 {
                        // The bad attempt-0 response may have been cached
                        // under the original key; clear it so the verified
                        // response can take its place.
                        self.cache
                            .remove(stable, prompt, provider.name(), max_tokens)?;
                        self.cache
                            .remove(stable, &current_prompt, provider.name(), max_tokens)?;
                    }
                    return Ok(Some(raw));
                }
                Err(reason) => {
                    *last_reason = reason.clone();
                    tracing::warn!(
                        model = provider.name(),
                        attempt = attempt + 1,
                        reason = reason.as_str(),
                        "malformed model response"
                    );
                    if attempt == 0 {
                        // query_once caches non-empty responses immediately;
                        // drop the bad entry before retrying
                        self.cache
                            .remove(stable, &current_prompt, provider.name(), max_tokens)?;
                    }
                    failed.push((provider.name().to_string(), current_prompt));
                }
            }
        }
        Ok(None)
    }

    /// Store the accepted response under the original prompt key and remove
    /// every cache entry recorded for a failed attempt.
    fn finish_success(
        &mut self,
        stable: &str,
        prompt: &str,
        model: &str,
        max_tokens: u32,
        response: &str,
        failed: &[(String, String)],
    ) -> Result<()> {
        for (failed_model, variant) in failed {
            self.cache.remove(stable, variant, failed_model, max_tokens)?;
        }
        self.cache.insert(stable, prompt, model, max_tokens, response)?;
        if !failed.is_empty() {
            println!(
                "    Query succeeded after {} failed attempt(s); bad cache entries cleaned",
                failed.len()
            );
        }
        Ok(())
    }

    /// Cache access for tests and the driver's idempotence checks.
    pub fn cache(&self) -> &ApiCache {
        &self.cache
    }
}
