//! Configuration for the extraction and tagging workflows.
//!
//! Every knob lives in [`WorkflowConfig`], built via
//! [`WorkflowConfigBuilder`]. Prompts and taxonomies are plain data here:
//! they are loaded once (defaults from [`crate::prompts`] or caller-supplied
//! text) and passed by value into the pipeline stages.

use crate::error::Pdf2AnkiError;
use crate::pipeline::assemble::MediaOptions;
use crate::pipeline::tag::TaggingPass;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts;
use crate::services::gemini::PLACEHOLDER_API_KEY;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Model used for extraction and both tagging passes unless overridden.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Configuration for one workflow run.
///
/// # Example
/// ```rust
/// use pdf2anki::WorkflowConfig;
/// use std::time::Duration;
///
/// let config = WorkflowConfig::builder()
///     .api_key("my-key")
///     .batch_size(5)
///     .batch_delay(Duration::from_secs(2))
///     .second_pass(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.passes.len(), 2);
/// ```
#[derive(Clone)]
pub struct WorkflowConfig {
    /// Generative-model credential. Empty or the placeholder means "not set".
    pub api_key: String,

    /// Model for visual and text extraction. Default: `gemini-2.0-flash`.
    pub extraction_model: String,

    pub visual_prompt: String,
    pub text_prompt: String,

    /// Characters per text chunk. Default: 30 000.
    pub chunk_size: usize,

    /// Pause between two text-chunk calls. Default: 5 s.
    pub chunk_delay: Duration,

    /// Rows per tagging call. Default: 10.
    pub batch_size: usize,

    /// Pause between two tagging calls. Default: 10 s.
    pub batch_delay: Duration,

    /// Tagging passes, applied in order. Pass 1 is always present.
    pub passes: Vec<TaggingPass>,

    /// Page render scale for page images (1.0 = 72 dpi). Default: 1.5.
    pub image_zoom: f32,

    /// Save page images straight into this folder (usually Anki's
    /// `collection.media`) instead of a per-run subfolder. Existing images
    /// there are overwritten.
    pub media_dir: Option<PathBuf>,

    /// Where outputs and checkpoints go. Default: the input file's folder.
    pub output_dir: Option<PathBuf>,

    /// Bulk mode: rename a failed input with an `UP_` prefix. Default: false.
    pub rename_failed: bool,

    pub media: MediaOptions,

    pub progress_callback: ProgressCallback,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            extraction_model: DEFAULT_MODEL.to_string(),
            visual_prompt: prompts::VISUAL_EXTRACTION_PROMPT.to_string(),
            text_prompt: prompts::TEXT_EXTRACTION_PROMPT.to_string(),
            chunk_size: 30_000,
            chunk_delay: Duration::from_secs(5),
            batch_size: 10,
            batch_delay: Duration::from_secs(10),
            passes: vec![default_pass_one(DEFAULT_MODEL)],
            image_zoom: 1.5,
            media_dir: None,
            output_dir: None,
            rename_failed: false,
            media: MediaOptions::default(),
            progress_callback: Arc::new(NoopProgressCallback),
        }
    }
}

fn default_pass_one(model: &str) -> TaggingPass {
    TaggingPass::new("pass 1", model, prompts::TAGGING_PASS_ONE_PROMPT)
}

fn default_pass_two(model: &str) -> TaggingPass {
    TaggingPass::new("pass 2", model, prompts::TAGGING_PASS_TWO_PROMPT)
}

impl fmt::Debug for WorkflowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.api_key.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("WorkflowConfig")
            .field("api_key", &key)
            .field("extraction_model", &self.extraction_model)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_delay", &self.chunk_delay)
            .field("batch_size", &self.batch_size)
            .field("batch_delay", &self.batch_delay)
            .field(
                "passes",
                &self
                    .passes
                    .iter()
                    .map(|p| format!("{} ({}, {} tags)", p.label, p.model, p.taxonomy.len()))
                    .collect::<Vec<_>>(),
            )
            .field("image_zoom", &self.image_zoom)
            .field("media_dir", &self.media_dir)
            .field("output_dir", &self.output_dir)
            .field("rename_failed", &self.rename_failed)
            .field("media", &self.media)
            .finish()
    }
}

impl WorkflowConfig {
    pub fn builder() -> WorkflowConfigBuilder {
        WorkflowConfigBuilder {
            config: Self::default(),
            second_pass: false,
            pass_one_model: None,
            pass_two_model: None,
            pass_one_prompt: None,
            pass_two_prompt: None,
            explicit_passes: None,
        }
    }

    /// `true` when a usable API key is configured.
    pub fn has_api_key(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && key != PLACEHOLDER_API_KEY
    }
}

/// Builder for [`WorkflowConfig`].
pub struct WorkflowConfigBuilder {
    config: WorkflowConfig,
    second_pass: bool,
    pass_one_model: Option<String>,
    pass_two_model: Option<String>,
    pass_one_prompt: Option<String>,
    pass_two_prompt: Option<String>,
    explicit_passes: Option<Vec<TaggingPass>>,
}

impl fmt::Debug for WorkflowConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowConfigBuilder")
            .field("config", &self.config)
            .field("second_pass", &self.second_pass)
            .finish()
    }
}

impl WorkflowConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn extraction_model(mut self, model: impl Into<String>) -> Self {
        self.config.extraction_model = model.into();
        self
    }

    pub fn visual_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.visual_prompt = prompt.into();
        self
    }

    pub fn text_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.text_prompt = prompt.into();
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n;
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.config.chunk_delay = delay;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.config.batch_delay = delay;
        self
    }

    /// Model for tagging pass 1. Default: the extraction model.
    pub fn tagging_model(mut self, model: impl Into<String>) -> Self {
        self.pass_one_model = Some(model.into());
        self
    }

    pub fn tagging_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.pass_one_prompt = Some(prompt.into());
        self
    }

    /// Enable the second tagging pass.
    pub fn second_pass(mut self, enabled: bool) -> Self {
        self.second_pass = enabled;
        self
    }

    /// Model for tagging pass 2. Default: the pass-1 model.
    pub fn second_pass_model(mut self, model: impl Into<String>) -> Self {
        self.pass_two_model = Some(model.into());
        self
    }

    pub fn second_pass_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.pass_two_prompt = Some(prompt.into());
        self
    }

    /// Replace the tagging passes wholesale; overrides every other
    /// pass-related setting.
    pub fn passes(mut self, passes: Vec<TaggingPass>) -> Self {
        self.explicit_passes = Some(passes);
        self
    }

    pub fn image_zoom(mut self, zoom: f32) -> Self {
        self.config.image_zoom = zoom;
        self
    }

    pub fn media_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.media_dir = Some(dir.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn rename_failed(mut self, v: bool) -> Self {
        self.config.rename_failed = v;
        self
    }

    pub fn media_options(mut self, media: MediaOptions) -> Self {
        self.config.media = media;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = cb;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkflowConfig, Pdf2AnkiError> {
        let mut config = self.config;

        config.passes = match self.explicit_passes {
            Some(passes) => passes,
            None => {
                let model_one = self
                    .pass_one_model
                    .unwrap_or_else(|| config.extraction_model.clone());
                let mut passes = vec![match self.pass_one_prompt {
                    Some(prompt) => TaggingPass::new("pass 1", model_one.clone(), prompt),
                    None => default_pass_one(&model_one),
                }];
                if self.second_pass {
                    let model_two = self.pass_two_model.unwrap_or(model_one);
                    passes.push(match self.pass_two_prompt {
                        Some(prompt) => TaggingPass::new("pass 2", model_two, prompt),
                        None => default_pass_two(&model_two),
                    });
                }
                passes
            }
        };

        validate(&config)?;
        Ok(config)
    }
}

fn validate(c: &WorkflowConfig) -> Result<(), Pdf2AnkiError> {
    if c.chunk_size == 0 {
        return Err(Pdf2AnkiError::InvalidConfig(
            "Chunk size must be ≥ 1".into(),
        ));
    }
    if c.batch_size == 0 {
        return Err(Pdf2AnkiError::InvalidConfig(
            "Batch size must be ≥ 1".into(),
        ));
    }
    if !(0.25..=8.0).contains(&c.image_zoom) {
        return Err(Pdf2AnkiError::InvalidConfig(format!(
            "Image zoom must be 0.25–8.0, got {}",
            c.image_zoom
        )));
    }
    if c.extraction_model.trim().is_empty() {
        return Err(Pdf2AnkiError::InvalidConfig(
            "Extraction model name is empty".into(),
        ));
    }
    if c.visual_prompt.trim().is_empty() || c.text_prompt.trim().is_empty() {
        return Err(Pdf2AnkiError::InvalidConfig(
            "Extraction prompts must not be empty".into(),
        ));
    }
    for pass in &c.passes {
        if pass.model.trim().is_empty() || pass.prompt.trim().is_empty() {
            return Err(Pdf2AnkiError::InvalidConfig(format!(
                "Tagging {} needs a model and a prompt",
                pass.label
            )));
        }
    }
    Ok(())
}
