//! Model and prompt configuration registry
//!
//! Prompt templates and model configs are versioned and append-only: an id
//! (`name@vN`) always denotes the same content. Each stage identifier is
//! bound to one system prompt, one user prompt and one model config, with
//! optional document-type-specific overrides.
//!
//! Versions are numbered per process, so an id alone does not pin content
//! across restarts. Fingerprints use [`PromptTemplate::content_key`] and
//! [`ModelConfig::content_key`], which append a digest of the content to the
//! id: editing a template or config always changes the fingerprints it feeds.

use filingforge_common::config::PipelineConfig;
use filingforge_common::errors::{AppError, Result};
use filingforge_common::types::{Document, Stage, StageId};
use filingforge_common::{DEFAULT_EXTRACTION_MODEL, DEFAULT_SYNTHESIS_MODEL};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Which message slot a template fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
}

/// An immutable prompt template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub role: PromptRole,
    pub text: String,
}

impl PromptTemplate {
    /// Id plus content digest, the form that enters fingerprints
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.name.as_bytes());
        write_field(&mut hasher, format!("{:?}", self.role).as_bytes());
        write_field(&mut hasher, self.text.as_bytes());
        keyed(&self.id, hasher)
    }
}

/// An immutable set of model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Total tokens the model accepts, prompt and output together
    pub context_window: u32,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ModelConfig {
    /// Characters of prompt text that fit alongside the output budget
    pub fn prompt_char_budget(&self) -> usize {
        self.context_window.saturating_sub(self.max_output_tokens) as usize * 4
    }

    /// Id plus a digest of every generation parameter
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, self.name.as_bytes());
        write_field(&mut hasher, self.model.as_bytes());
        hasher.update(self.temperature.to_bits().to_be_bytes());
        hasher.update(self.max_output_tokens.to_be_bytes());
        hasher.update(self.context_window.to_be_bytes());
        write_field(&mut hasher, format!("{:?}", self.top_k).as_bytes());
        write_field(&mut hasher, format!("{:?}", self.top_p.map(f32::to_bits)).as_bytes());
        write_field(&mut hasher, format!("{:?}", self.seed).as_bytes());
        hasher.update((self.extra.len() as u64).to_be_bytes());
        for (key, value) in &self.extra {
            write_field(&mut hasher, key.as_bytes());
            write_field(&mut hasher, value.to_string().as_bytes());
        }
        keyed(&self.id, hasher)
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn keyed(id: &str, hasher: Sha256) -> String {
    let digest = hex::encode(hasher.finalize());
    format!("{}#{}", id, &digest[..16])
}

/// Everything the executor needs to run one stage identifier
#[derive(Debug, Clone)]
pub struct StageBinding {
    pub stage_id: StageId,
    pub system_prompt: Arc<PromptTemplate>,
    pub user_prompt: Arc<PromptTemplate>,
    pub model_config: Arc<ModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingIds {
    system_prompt: String,
    user_prompt: String,
    model_config: String,
}

/// Build a versioned id
pub fn versioned_id(name: &str, version: u32) -> String {
    format!("{}@v{}", name, version)
}

/// Registry of prompts, model configs and stage bindings
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    prompts: HashMap<String, Arc<PromptTemplate>>,
    latest_prompt: HashMap<String, u32>,
    models: HashMap<String, Arc<ModelConfig>>,
    bindings: HashMap<(StageId, Option<String>), BindingIds>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a template under `name`. Identical text returns the current
    /// version; changed text creates version N+1.
    pub fn publish_prompt(
        &mut self,
        name: &str,
        role: PromptRole,
        text: &str,
    ) -> Result<Arc<PromptTemplate>> {
        if let Some(&latest) = self.latest_prompt.get(name) {
            let current = &self.prompts[&versioned_id(name, latest)];
            if current.text == text && current.role == role {
                return Ok(current.clone());
            }
        }

        let version = self.latest_prompt.get(name).map_or(1, |v| v + 1);
        self.register_prompt(PromptTemplate {
            id: versioned_id(name, version),
            name: name.to_string(),
            version,
            role,
            text: text.to_string(),
        })
    }

    /// Register a template with an explicit version
    pub fn register_prompt(&mut self, template: PromptTemplate) -> Result<Arc<PromptTemplate>> {
        if template.id != versioned_id(&template.name, template.version) {
            return Err(AppError::Validation {
                message: format!("prompt id '{}' does not match its name and version", template.id),
                field: Some("id".into()),
            });
        }
        if let Some(existing) = self.prompts.get(&template.id) {
            if **existing != template {
                return Err(AppError::ConfigImmutable { id: template.id });
            }
            return Ok(existing.clone());
        }

        let latest = self.latest_prompt.entry(template.name.clone()).or_insert(0);
        *latest = (*latest).max(template.version);

        debug!(id = %template.id, "Prompt template registered");
        let template = Arc::new(template);
        self.prompts.insert(template.id.clone(), template.clone());
        Ok(template)
    }

    /// Register a model config; its id is fixed forever
    pub fn register_model_config(&mut self, config: ModelConfig) -> Result<Arc<ModelConfig>> {
        if config.id != versioned_id(&config.name, config.version) {
            return Err(AppError::Validation {
                message: format!("model config id '{}' does not match its name and version", config.id),
                field: Some("id".into()),
            });
        }
        if config.max_output_tokens >= config.context_window {
            return Err(AppError::Validation {
                message: format!("model config '{}' leaves no room for input", config.id),
                field: Some("context_window".into()),
            });
        }
        if let Some(existing) = self.models.get(&config.id) {
            if **existing != config {
                return Err(AppError::ConfigImmutable { id: config.id });
            }
            return Ok(existing.clone());
        }

        debug!(id = %config.id, model = %config.model, "Model config registered");
        let config = Arc::new(config);
        self.models.insert(config.id.clone(), config.clone());
        Ok(config)
    }

    /// Bind a stage identifier (optionally for one document type) to a
    /// system prompt, user prompt and model config
    pub fn bind(
        &mut self,
        stage_id: StageId,
        document_type: Option<&str>,
        system_prompt_id: &str,
        user_prompt_id: &str,
        model_config_id: &str,
    ) -> Result<()> {
        self.expect_prompt(system_prompt_id, PromptRole::System)?;
        self.expect_prompt(user_prompt_id, PromptRole::User)?;
        if !self.models.contains_key(model_config_id) {
            return Err(AppError::NotFound {
                resource_type: "model_config".into(),
                id: model_config_id.into(),
            });
        }

        self.bindings.insert(
            (stage_id, document_type.map(str::to_string)),
            BindingIds {
                system_prompt: system_prompt_id.to_string(),
                user_prompt: user_prompt_id.to_string(),
                model_config: model_config_id.to_string(),
            },
        );
        Ok(())
    }

    fn expect_prompt(&self, id: &str, role: PromptRole) -> Result<()> {
        match self.prompts.get(id) {
            Some(p) if p.role == role => Ok(()),
            Some(_) => Err(AppError::Validation {
                message: format!("prompt '{}' is not a {:?} template", id, role),
                field: Some("role".into()),
            }),
            None => Err(AppError::NotFound {
                resource_type: "prompt_template".into(),
                id: id.into(),
            }),
        }
    }

    /// Resolve the binding for a stage identifier; a document-type-specific
    /// binding overrides the stage default
    pub fn binding(&self, stage_id: StageId, document_type: Option<&str>) -> Result<StageBinding> {
        let ids = document_type
            .and_then(|t| self.bindings.get(&(stage_id, Some(t.to_string()))))
            .or_else(|| self.bindings.get(&(stage_id, None)))
            .ok_or_else(|| AppError::Configuration {
                message: format!("no binding for stage '{}'", stage_id),
            })?;

        Ok(StageBinding {
            stage_id,
            system_prompt: self.prompts[&ids.system_prompt].clone(),
            user_prompt: self.prompts[&ids.user_prompt].clone(),
            model_config: self.models[&ids.model_config].clone(),
        })
    }

    pub fn prompt(&self, id: &str) -> Option<Arc<PromptTemplate>> {
        self.prompts.get(id).cloned()
    }

    pub fn model_config(&self, id: &str) -> Option<Arc<ModelConfig>> {
        self.models.get(id).cloned()
    }

    /// Registry with the built-in prompts, model configs and bindings
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();

        registry.register_model_config(ModelConfig {
            id: versioned_id("extraction", 1),
            name: "extraction".into(),
            version: 1,
            model: DEFAULT_EXTRACTION_MODEL.into(),
            temperature: 0.1,
            max_output_tokens: 900,
            context_window: 128_000,
            top_k: None,
            top_p: None,
            seed: Some(7),
            extra: BTreeMap::new(),
        })?;
        registry.register_model_config(ModelConfig {
            id: versioned_id("single_pass", 1),
            name: "single_pass".into(),
            version: 1,
            model: DEFAULT_EXTRACTION_MODEL.into(),
            temperature: 0.0,
            max_output_tokens: 400,
            context_window: 16_000,
            top_k: None,
            top_p: None,
            seed: Some(7),
            extra: BTreeMap::new(),
        })?;
        registry.register_model_config(ModelConfig {
            id: versioned_id("synthesis", 1),
            name: "synthesis".into(),
            version: 1,
            model: DEFAULT_SYNTHESIS_MODEL.into(),
            temperature: 0.2,
            max_output_tokens: 1_600,
            context_window: 128_000,
            top_k: None,
            top_p: Some(0.95),
            seed: Some(7),
            extra: BTreeMap::new(),
        })?;

        let analyst = registry.publish_prompt("analyst_system", PromptRole::System, ANALYST_SYSTEM)?;
        let summary = registry.publish_prompt("document_summary", PromptRole::User, DOCUMENT_SUMMARY)?;
        let short = registry.publish_prompt("short_document", PromptRole::User, SHORT_DOCUMENT)?;
        let risk = registry.publish_prompt("risk_factors_summary", PromptRole::User, RISK_FACTORS_SUMMARY)?;
        let aggregate = registry.publish_prompt("period_aggregate", PromptRole::User, PERIOD_AGGREGATE)?;
        let brief = registry.publish_prompt("brief", PromptRole::User, BRIEF)?;

        registry.bind(
            StageId::full(Stage::DocumentSummary),
            None,
            &analyst.id,
            &summary.id,
            "extraction@v1",
        )?;
        registry.bind(
            StageId::full(Stage::DocumentSummary),
            Some("risk_factors"),
            &analyst.id,
            &risk.id,
            "extraction@v1",
        )?;
        registry.bind(
            StageId::single_pass(Stage::DocumentSummary),
            None,
            &analyst.id,
            &short.id,
            "single_pass@v1",
        )?;
        registry.bind(
            StageId::full(Stage::PeriodAggregate),
            None,
            &analyst.id,
            &aggregate.id,
            "synthesis@v1",
        )?;
        registry.bind(StageId::full(Stage::Brief), None, &analyst.id, &brief.id, "synthesis@v1")?;

        Ok(registry)
    }

    /// Apply an override file (TOML, YAML or JSON) on top of this registry
    pub fn load_overrides(&mut self, path: &str) -> Result<()> {
        let file: RegistryFile = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;

        for prompt in &file.prompts {
            self.publish_prompt(&prompt.name, prompt.role, &prompt.text)?;
        }
        for model in file.models {
            self.register_model_config(model)?;
        }
        for binding in &file.bindings {
            self.bind(
                binding.stage.parse()?,
                binding.document_type.as_deref(),
                &binding.system_prompt,
                &binding.user_prompt,
                &binding.model_config,
            )?;
        }

        info!(
            path,
            prompts = file.prompts.len(),
            bindings = file.bindings.len(),
            "Registry overrides applied"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    prompts: Vec<PromptEntry>,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    bindings: Vec<BindingEntry>,
}

#[derive(Debug, Deserialize)]
struct PromptEntry {
    name: String,
    role: PromptRole,
    text: String,
}

#[derive(Debug, Deserialize)]
struct BindingEntry {
    stage: String,
    #[serde(default)]
    document_type: Option<String>,
    system_prompt: String,
    user_prompt: String,
    model_config: String,
}

/// Chooses the route a stage-1 document takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub single_pass_threshold_chars: usize,
}

impl RoutingPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            single_pass_threshold_chars: config.single_pass_threshold_chars,
        }
    }

    /// Short documents take the abbreviated single-pass route
    pub fn route(&self, document: &Document) -> StageId {
        if document.char_len() < self.single_pass_threshold_chars {
            StageId::single_pass(Stage::DocumentSummary)
        } else {
            StageId::full(Stage::DocumentSummary)
        }
    }
}

const ANALYST_SYSTEM: &str = "You are a financial analyst writing for credit and equity \
research readers. Use only the material supplied. Do not speculate and do not invent \
figures. Begin your answer with a single line of the form `Summary: <one sentence>`.";

const DOCUMENT_SUMMARY: &str = "Company: {{company}}\nDocument type: {{document_type}}\n\
Period: {{periods}}\n\nSummarize the document below. Cover material changes, quantified \
exposures and anything management flags as new.\n\n{{inputs}}";

const SHORT_DOCUMENT: &str = "Company: {{company}}\nDocument type: {{document_type}}\n\
Period: {{periods}}\n\nThe document below is short and is not part of any \
cross-period analysis. Restate its substance in a few sentences for a reader new to the \
company.\n\n{{inputs}}";

const RISK_FACTORS_SUMMARY: &str = "Company: {{company}}\nPeriod: {{periods}}\n\n\
List the risk factors disclosed below, grouped by theme. Mark any risk that is new or \
materially expanded.\n\n{{inputs}}";

const PERIOD_AGGREGATE: &str = "Company: {{company}}\nDocument type: {{document_type}}\n\
Periods: {{periods}}\n\nThe summaries below cover the same document type across periods. \
Describe how the disclosures evolved: what was added, dropped or re-weighted, and the \
trend it suggests.\n\n{{inputs}}";

const BRIEF: &str = "Subject: {{company}}\nPeriods: {{periods}}\n\nWrite a brief of at \
most five short paragraphs for a reader new to the subject, drawing on the analyses \
below.\n\n{{inputs}}";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_bind_every_stage() {
        let registry = ConfigRegistry::with_defaults().unwrap();

        for stage_id in [
            StageId::full(Stage::DocumentSummary),
            StageId::single_pass(Stage::DocumentSummary),
            StageId::full(Stage::PeriodAggregate),
            StageId::full(Stage::Brief),
        ] {
            let binding = registry.binding(stage_id, None).unwrap();
            assert_eq!(binding.stage_id, stage_id);
            assert_eq!(binding.system_prompt.role, PromptRole::System);
            assert_eq!(binding.user_prompt.role, PromptRole::User);
        }

        let synthesis = registry.binding(StageId::full(Stage::Brief), None).unwrap();
        assert_eq!(synthesis.model_config.model, DEFAULT_SYNTHESIS_MODEL);
    }

    #[test]
    fn test_document_type_override() {
        let registry = ConfigRegistry::with_defaults().unwrap();
        let stage = StageId::full(Stage::DocumentSummary);

        let risk = registry.binding(stage, Some("risk_factors")).unwrap();
        let other = registry.binding(stage, Some("md_and_a")).unwrap();

        assert_eq!(risk.user_prompt.id, "risk_factors_summary@v1");
        assert_eq!(other.user_prompt.id, "document_summary@v1");
    }

    #[test]
    fn test_publish_versions_on_change_only() {
        let mut registry = ConfigRegistry::new();

        let v1 = registry.publish_prompt("p", PromptRole::User, "one").unwrap();
        let again = registry.publish_prompt("p", PromptRole::User, "one").unwrap();
        let v2 = registry.publish_prompt("p", PromptRole::User, "two").unwrap();

        assert_eq!(v1.id, "p@v1");
        assert_eq!(again.id, "p@v1");
        assert_eq!(v2.id, "p@v2");
        // Old version stays resolvable and unchanged
        assert_eq!(registry.prompt("p@v1").unwrap().text, "one");
    }

    #[test]
    fn test_redefining_an_id_is_rejected() {
        let mut registry = ConfigRegistry::with_defaults().unwrap();
        let mut changed = (*registry.model_config("synthesis@v1").unwrap()).clone();
        changed.temperature = 0.9;

        let err = registry.register_model_config(changed).unwrap_err();
        assert!(matches!(err, AppError::ConfigImmutable { ref id } if id == "synthesis@v1"));

        let err = registry
            .register_prompt(PromptTemplate {
                id: "brief@v1".into(),
                name: "brief".into(),
                version: 1,
                role: PromptRole::User,
                text: "different".into(),
            })
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigImmutable { .. }));
    }

    #[test]
    fn test_content_key_tracks_content_across_registries() {
        // Two processes that each start numbering from v1
        let mut first = ConfigRegistry::new();
        let mut second = ConfigRegistry::new();
        let a = first.publish_prompt("custom", PromptRole::User, "List the risks.").unwrap();
        let b = second.publish_prompt("custom", PromptRole::User, "List the risks briefly.").unwrap();
        let a_again = second.publish_prompt("other", PromptRole::User, "List the risks.").unwrap();

        assert_eq!(a.id, b.id);
        assert_ne!(a.content_key(), b.content_key());
        assert!(a.content_key().starts_with("custom@v1#"));
        assert_ne!(a.content_key(), a_again.content_key());

        let defaults = ConfigRegistry::with_defaults().unwrap();
        let config = defaults.model_config("synthesis@v1").unwrap();
        let mut warmer = (*config).clone();
        warmer.temperature = 0.7;
        assert_eq!(config.content_key(), defaults.model_config("synthesis@v1").unwrap().content_key());
        assert_ne!(config.content_key(), warmer.content_key());
    }

    #[test]
    fn test_bind_validates_references() {
        let mut registry = ConfigRegistry::with_defaults().unwrap();
        let stage = StageId::full(Stage::Brief);

        assert!(registry
            .bind(stage, None, "analyst_system@v1", "brief@v1", "missing@v1")
            .is_err());
        // User template in the system slot
        assert!(registry
            .bind(stage, None, "brief@v1", "brief@v1", "synthesis@v1")
            .is_err());
    }

    #[test]
    fn test_routing_threshold() {
        let policy = RoutingPolicy {
            single_pass_threshold_chars: 20,
        };
        let short = Document::new("ACME", "2023", "press_release", "Tiny note.");
        let long = Document::new("ACME", "2023", "annual_report", &"word ".repeat(20));

        assert_eq!(policy.route(&short), StageId::single_pass(Stage::DocumentSummary));
        assert_eq!(policy.route(&long), StageId::full(Stage::DocumentSummary));
    }

    #[test]
    fn test_prompt_budget_reserves_output() {
        let registry = ConfigRegistry::with_defaults().unwrap();
        let single = registry.model_config("single_pass@v1").unwrap();
        assert_eq!(single.prompt_char_budget(), (16_000 - 400) * 4);
    }
}
