//! Generative-model collaborator: the [`GenerativeModel`] trait and its
//! Google Gemini REST implementation.
//!
//! The pipeline only needs four capabilities (credential check, file upload,
//! content generation, file deletion) so that is all the trait exposes.
//! Tests drive the pipeline with scripted in-process implementations.
//!
//! [`GeminiClient`] talks to the Generative Language API directly over
//! `reqwest`:
//!
//! ```text
//! upload   POST  /upload/v1beta/files            (resumable: start, then upload+finalize)
//!          GET   /v1beta/files/{id}              (poll while state == PROCESSING)
//! generate POST  /v1beta/models/{model}:generateContent
//! delete   DELETE /v1beta/files/{id}
//! ```
//!
//! Generation calls have no client-side timeout; they block until the
//! provider answers or the connection fails.

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Credential value shipped in sample configs; never a real key.
pub const PLACEHOLDER_API_KEY: &str = "YOUR_API_KEY_HERE";

/// Public Generative Language API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Reject empty and placeholder keys before any network call.
pub fn validate_api_key(key: &str) -> Result<(), ServiceError> {
    let key = key.trim();
    if key.is_empty() || key == PLACEHOLDER_API_KEY {
        Err(ServiceError::InvalidCredential)
    } else {
        Ok(())
    }
}

// ── Request / response model ─────────────────────────────────────────────

/// Handle to a file stored on the provider side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Resource name, e.g. `files/abc123`.
    pub name: String,
    /// URI to reference the file from a prompt.
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    File { uri: String, mime_type: String },
}

impl From<&UploadedFile> for Part {
    fn from(f: &UploadedFile) -> Self {
        Part::File {
            uri: f.uri.clone(),
            mime_type: f.mime_type.clone(),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::Text(text.into())])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text parts, for logging and test assertions.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::File { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub turns: Vec<Turn>,
    /// Constrain the answer to `application/json`.
    pub json_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" => FinishReason::Safety,
            "RECITATION" => FinishReason::Recitation,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// What came back from one generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateResponse {
    /// Joined text parts of the first candidate; `None` when there was no
    /// candidate or it carried no text part.
    pub text: Option<String>,
    /// Prompt-level block reason, if the provider set a real one.
    pub block_reason: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

impl GenerateResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            block_reason: None,
            finish_reason: Some(FinishReason::Stop),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            text: None,
            block_reason: Some(reason.into()),
            finish_reason: Some(FinishReason::Safety),
        }
    }

    /// A block with nothing usable: block reason set and the candidate (if
    /// any) stopped for safety.
    pub fn is_fully_blocked(&self) -> bool {
        self.block_reason.is_some()
            && matches!(self.finish_reason, None | Some(FinishReason::Safety))
    }
}

// ── Trait ────────────────────────────────────────────────────────────────

/// The generative-model capabilities the pipeline relies on.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Local credential check; must not touch the network.
    fn check_credentials(&self) -> Result<(), ServiceError>;

    /// Upload a local file so prompts can reference it.
    async fn upload(&self, path: &Path, display_name: &str) -> Result<UploadedFile, ServiceError> {
        let _ = (path, display_name);
        Err(ServiceError::Unsupported("file upload".into()))
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ServiceError>;

    /// Remove a previously uploaded file.
    async fn delete(&self, file: &UploadedFile) -> Result<(), ServiceError> {
        let _ = file;
        Err(ServiceError::Unsupported("file delete".into()))
    }
}

// ── Wire format ──────────────────────────────────────────────────────────

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    safety_settings: Vec<WireSafetySetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Debug, Serialize)]
enum WirePart<'a> {
    #[serde(rename = "text")]
    Text(&'a str),
    #[serde(rename = "fileData")]
    FileData(WireFileData<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

#[derive(Debug, Serialize)]
struct WireSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCandidateContent {
    #[serde(default)]
    parts: Vec<WireOutPart>,
}

#[derive(Debug, Deserialize)]
struct WireOutPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUploadResponse {
    file: WireFile,
}

/// JSON body for `models/{model}:generateContent`.
pub fn build_generate_body(request: &GenerateRequest) -> serde_json::Value {
    let contents = request
        .turns
        .iter()
        .map(|turn| WireContent {
            role: Some(turn.role.as_str()),
            parts: turn
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text(t) => WirePart::Text(t),
                    Part::File { uri, mime_type } => WirePart::FileData(WireFileData {
                        mime_type,
                        file_uri: uri,
                    }),
                })
                .collect(),
        })
        .collect();

    let wire = WireRequest {
        contents,
        system_instruction: request.system_instruction.as_deref().map(|s| WireContent {
            role: None,
            parts: vec![WirePart::Text(s)],
        }),
        safety_settings: HARM_CATEGORIES
            .into_iter()
            .map(|category| WireSafetySetting {
                category,
                threshold: "BLOCK_NONE",
            })
            .collect(),
        generation_config: request.json_output.then_some(WireGenerationConfig {
            response_mime_type: "application/json",
        }),
    };

    serde_json::to_value(&wire).unwrap_or_default()
}

/// Interpret a `generateContent` response body.
pub fn parse_generate_response(body: &str) -> Result<GenerateResponse, ServiceError> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::UnexpectedResponse(format!("generateContent: {e}")))?;

    let block_reason = wire
        .prompt_feedback
        .and_then(|f| f.block_reason)
        .filter(|r| !r.is_empty() && r != "BLOCK_REASON_UNSPECIFIED");

    let first = wire.candidates.into_iter().next();
    let finish_reason = first
        .as_ref()
        .and_then(|c| c.finish_reason.as_deref())
        .map(FinishReason::parse);

    let text = first.and_then(|c| c.content).and_then(|content| {
        let texts: Vec<String> = content.parts.into_iter().filter_map(|p| p.text).collect();
        (!texts.is_empty()).then(|| texts.concat())
    });

    Ok(GenerateResponse {
        text,
        block_reason,
        finish_reason,
    })
}

fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

// ── REST client ──────────────────────────────────────────────────────────

/// Gemini over the public REST API.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 150,
        }
    }

    /// Point the client at another endpoint (proxies, local mocks).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        let resp = req
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(500)
                .collect();
            return Err(ServiceError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn send_text(&self, req: reqwest::RequestBuilder) -> Result<String, ServiceError> {
        self.send(req)
            .await?
            .text()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))
    }

    async fn wait_until_active(&self, mut file: WireFile) -> Result<WireFile, ServiceError> {
        let mut polls = 0;
        while file.state.as_deref() == Some("PROCESSING") {
            if polls >= self.max_polls {
                return Err(ServiceError::UnexpectedResponse(format!(
                    "file {} still processing after {} polls",
                    file.name, polls
                )));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
            let url = format!("{}/v1beta/{}", self.base_url, file.name);
            let body = self.send_text(self.http.get(&url)).await?;
            file = serde_json::from_str(&body)
                .map_err(|e| ServiceError::UnexpectedResponse(format!("file status: {e}")))?;
            debug!("file {} state {:?}", file.name, file.state);
        }
        if file.state.as_deref() == Some("FAILED") {
            return Err(ServiceError::UnexpectedResponse(format!(
                "provider failed to process {}",
                file.name
            )));
        }
        Ok(file)
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    fn check_credentials(&self) -> Result<(), ServiceError> {
        validate_api_key(&self.api_key)
    }

    async fn upload(&self, path: &Path, display_name: &str) -> Result<UploadedFile, ServiceError> {
        self.check_credentials()?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::Io(format!("{}: {e}", path.display())))?;
        let mime_type = guess_mime_type(path);

        // ── Step 1: open a resumable session ─────────────────────────────
        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }));
        let resp = self.send(start).await?;
        let upload_url = resp
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::UnexpectedResponse("missing x-goog-upload-url".into()))?;

        // ── Step 2: send the bytes and finalize ──────────────────────────
        let size = bytes.len();
        let finalize = self
            .http
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes);
        let body = self.send_text(finalize).await?;
        let uploaded: WireUploadResponse = serde_json::from_str(&body)
            .map_err(|e| ServiceError::UnexpectedResponse(format!("upload: {e}")))?;

        // ── Step 3: wait until the provider can use it ───────────────────
        let file = self.wait_until_active(uploaded.file).await?;
        info!("Uploaded {} ({} bytes) as {}", path.display(), size, file.name);

        Ok(UploadedFile {
            name: file.name,
            uri: file.uri,
            mime_type: if file.mime_type.is_empty() {
                mime_type.to_string()
            } else {
                file.mime_type
            },
        })
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ServiceError> {
        self.check_credentials()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let body = self
            .send_text(self.http.post(url).json(&build_generate_body(request)))
            .await?;
        let response = parse_generate_response(&body)?;
        if let Some(reason) = &response.block_reason {
            warn!(
                "{}: prompt feedback block reason {} (finish {:?})",
                request.model, reason, response.finish_reason
            );
        }
        Ok(response)
    }

    async fn delete(&self, file: &UploadedFile) -> Result<(), ServiceError> {
        self.check_credentials()?;
        let url = format!("{}/v1beta/{}", self.base_url, file.name);
        self.send(self.http.delete(url)).await?;
        debug!("Deleted uploaded file {}", file.name);
        Ok(())
    }
}
