//! Stage executor
//!
//! Runs one generation step at most once per fingerprint:
//! 1. Fingerprint the request and consult the store
//! 2. Render prompts, clipping inputs to the model's context window
//! 3. Call the completion service with bounded exponential backoff
//! 4. Quality-check the output and derive its summary
//! 5. Persist, resolving fingerprint races in favour of the stored row

use crate::error::StageError;
use crate::fingerprint;
use crate::quality::{derive_summary, QualityPolicy};
use crate::registry::{ConfigRegistry, StageBinding};
use backoff::ExponentialBackoffBuilder;
use filingforge_common::config::PipelineConfig;
use filingforge_common::errors::AppError;
use filingforge_common::llm::{Completion, CompletionClient, CompletionError, CompletionRequest};
use filingforge_common::metrics;
use filingforge_common::store::PipelineStore;
use filingforge_common::types::{
    Fingerprint, GeneratedContent, InputRef, NewGeneratedContent, StageId, TokenUsage,
};
use regex_lite::{Captures, Regex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Bounded retry settings for completion calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// One generation step to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub stage_id: StageId,
    pub company_ref: String,
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    /// Ordered; order is part of the fingerprint
    pub inputs: Vec<InputRef>,
}

/// Outcome of a successful step
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub content: GeneratedContent,
    /// Served from the store without a completion call
    pub cached: bool,
    pub attempts: u32,
    /// Tokens paid by this step; zero on a cache hit, the full call when
    /// another writer stored the same fingerprint first
    pub spent: TokenUsage,
}

/// Executes stage requests against the store and completion service
pub struct StageExecutor {
    store: Arc<dyn PipelineStore>,
    client: Arc<dyn CompletionClient>,
    registry: Arc<ConfigRegistry>,
    quality: QualityPolicy,
    retry: RetryPolicy,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        client: Arc<dyn CompletionClient>,
        registry: Arc<ConfigRegistry>,
        quality: QualityPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            registry,
            quality,
            retry,
        }
    }

    /// Binding and fingerprint a request resolves to
    pub fn fingerprint(&self, request: &StageRequest) -> Result<(StageBinding, Fingerprint), StageError> {
        let binding = self
            .registry
            .binding(request.stage_id, request.document_type.as_deref())?;
        let fp = fingerprint::compute(
            request.stage_id,
            &request.inputs,
            &binding.system_prompt.content_key(),
            &binding.user_prompt.content_key(),
            &binding.model_config.content_key(),
        );
        Ok((binding, fp))
    }

    /// Run one generation step
    #[instrument(
        skip(self, request),
        fields(stage = %request.stage_id, company = %request.company_ref, inputs = request.inputs.len())
    )]
    pub async fn execute(&self, request: &StageRequest) -> Result<Execution, StageError> {
        if request.inputs.is_empty() {
            return Err(StageError::missing("request has no inputs"));
        }

        let (binding, fp) = self.fingerprint(request)?;
        let stage = request.stage_id.to_string();

        if let Some(existing) = self.store.lookup(&fp).await? {
            metrics::record_cache(true, &stage);
            debug!(fingerprint = %fp.short(), content_id = %existing.id, "Generation cache hit");
            return Self::usable(existing, true, 0, TokenUsage::default());
        }
        metrics::record_cache(false, &stage);

        let (completion_request, clip_warning) = self.render(request, &binding).await?;
        let (completion, attempts) = self.call_with_retry(&stage, &completion_request).await?;

        let report = self.quality.check(&completion);
        let mut warnings: Vec<String> = clip_warning.into_iter().collect();
        warnings.extend(report.warnings);

        let summary = if report.rejected.is_some() {
            String::new()
        } else {
            derive_summary(&report.text)
        };

        let spent = TokenUsage {
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        };
        let new = NewGeneratedContent {
            fingerprint: fp,
            stage: request.stage_id,
            company_ref: request.company_ref.clone(),
            document_type: request.document_type.clone(),
            period_refs: request.period_refs.clone(),
            inputs: request.inputs.clone(),
            model_config_id: binding.model_config.id.clone(),
            system_prompt_id: binding.system_prompt.id.clone(),
            user_prompt_id: binding.user_prompt.id.clone(),
            text: report.text,
            summary,
            usage: spent,
            warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
            error_state: report.rejected,
        };

        let (content, raced) = self.persist(new).await?;
        if content.is_usable() {
            info!(
                content_id = %content.id,
                attempts,
                input_tokens = content.usage.input_tokens,
                output_tokens = content.usage.output_tokens,
                warning = content.warning.as_deref().unwrap_or(""),
                "Generated content stored"
            );
        }
        Self::usable(content, raced, attempts, spent)
    }

    /// Turn a stored row into the step's outcome; rejected rows stay rejected
    fn usable(
        content: GeneratedContent,
        cached: bool,
        attempts: u32,
        spent: TokenUsage,
    ) -> Result<Execution, StageError> {
        match content.error_state.clone() {
            Some(reason) => {
                warn!(content_id = %content.id, reason = %reason, "Stored output is unusable");
                Err(StageError::MalformedOutput {
                    reason,
                    content_id: Some(content.id),
                    spent,
                })
            }
            None => Ok(Execution {
                content,
                cached,
                attempts,
                spent,
            }),
        }
    }

    /// Insert the row; a lost fingerprint race yields the stored winner
    async fn persist(&self, new: NewGeneratedContent) -> Result<(GeneratedContent, bool), StageError> {
        let fp = new.fingerprint.clone();
        match self.store.insert_content(new).await {
            Ok(content) => Ok((content, false)),
            Err(AppError::DuplicateFingerprint { .. }) => {
                debug!(fingerprint = %fp.short(), "Lost insert race, using stored row");
                let winner = self.store.lookup(&fp).await?.ok_or_else(|| AppError::Internal {
                    message: format!("fingerprint {} reported duplicate but not found", fp),
                })?;
                Ok((winner, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Render system and user prompts for a request
    async fn render(
        &self,
        request: &StageRequest,
        binding: &StageBinding,
    ) -> Result<(CompletionRequest, Option<String>), StageError> {
        let sections = self.input_sections(&request.inputs).await?;
        let inputs_text = sections.join("\n\n");

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("company", request.company_ref.clone());
        vars.insert("document_type", request.document_type.clone().unwrap_or_else(|| "all".into()));
        vars.insert("periods", request.period_refs.join(", "));
        vars.insert("inputs", String::new());

        let system = render_template(&binding.system_prompt.text, &vars);
        let frame = render_template(&binding.user_prompt.text, &vars);

        let model = &binding.model_config;
        let budget = model
            .prompt_char_budget()
            .saturating_sub(system.chars().count() + frame.chars().count());
        let total = inputs_text.chars().count();

        let (inputs_text, clip_warning) = if total > budget {
            warn!(budget, total, "Inputs exceed the context window, clipping");
            (
                inputs_text.chars().take(budget).collect::<String>(),
                Some(format!("inputs clipped to {} of {} chars", budget, total)),
            )
        } else {
            (inputs_text, None)
        };
        vars.insert("inputs", inputs_text);

        Ok((
            CompletionRequest {
                system,
                user: render_template(&binding.user_prompt.text, &vars),
                model: model.model.clone(),
                temperature: model.temperature,
                max_output_tokens: model.max_output_tokens,
                top_p: model.top_p,
                top_k: model.top_k,
                seed: model.seed,
                extra: model.extra.clone(),
            },
            clip_warning,
        ))
    }

    /// Text of each input, labelled and in request order
    async fn input_sections(&self, inputs: &[InputRef]) -> Result<Vec<String>, StageError> {
        let mut sections = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let section = match input {
                InputRef::Document(id) => {
                    let doc = self
                        .store
                        .get_document(*id)
                        .await?
                        .ok_or_else(|| StageError::missing(format!("document {} not found", id)))?;
                    format!("[{}] {} {}\n{}", i + 1, doc.document_type, doc.period_ref, doc.text.trim())
                }
                InputRef::Content(id) => {
                    let content = self
                        .store
                        .get_content(*id)
                        .await?
                        .filter(GeneratedContent::is_usable)
                        .ok_or_else(|| StageError::missing(format!("content {} not usable", id)))?;
                    format!(
                        "[{}] {} {} {}\n{}",
                        i + 1,
                        content.document_type.as_deref().unwrap_or(&content.company_ref),
                        content.stage,
                        content.period_refs.join(", "),
                        content.text.trim()
                    )
                }
            };
            sections.push(section);
        }
        Ok(sections)
    }

    /// Call the completion service, retrying transient failures
    async fn call_with_retry(
        &self,
        stage: &str,
        request: &CompletionRequest,
    ) -> Result<(Completion, u32), StageError> {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.max_attempts.max(1);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_backoff)
            .with_max_interval(self.retry.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        let counter = &attempts;
        let result = backoff::future::retry_notify(
            policy,
            move || async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let started = Instant::now();
                let outcome = self.client.complete(request).await;
                let elapsed = started.elapsed().as_secs_f64();

                match outcome {
                    Ok(completion) => {
                        metrics::record_completion(
                            elapsed,
                            stage,
                            &completion.model,
                            completion.input_tokens,
                            completion.output_tokens,
                            true,
                        );
                        Ok(completion)
                    }
                    Err(err) => {
                        metrics::record_completion(elapsed, stage, &request.model, 0, 0, false);
                        if err.is_transient() && attempt < max_attempts {
                            let retry_after =
                                err.retry_after().map(|wait| wait.min(self.retry.max_backoff));
                            Err(backoff::Error::Transient { err, retry_after })
                        } else {
                            Err(backoff::Error::Permanent(err))
                        }
                    }
                }
            },
            |err: CompletionError, wait: Duration| {
                metrics::record_retry(stage);
                warn!(
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    attempt = attempts.load(Ordering::SeqCst),
                    max_attempts,
                    "Completion failed, retrying"
                );
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(completion) => Ok((completion, attempts)),
            Err(CompletionError::Transient { message, .. }) => {
                Err(StageError::Transient { message, attempts })
            }
            Err(CompletionError::Rejected { status, message }) => {
                Err(StageError::Rejected { status, message })
            }
        }
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Substitute `{{name}}` placeholders; unknown names are left in place
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
