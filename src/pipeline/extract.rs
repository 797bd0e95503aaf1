//! Extraction callers: document → question/answer records.
//!
//! * [`extract_visual`] uploads the whole PDF and asks for every Q/A pair in
//!   one JSON-constrained call. Any failure fails the document.
//! * [`extract_text`] walks the text in fixed-size chunks, one call per
//!   chunk. Provider and parse failures only cost their chunk; anything
//!   unexpected aborts the whole call.
//!
//! Both snapshot their accumulated records through the [`Checkpoint`].

use crate::error::{Pdf2AnkiError, ServiceError};
use crate::pipeline::checkpoint::Checkpoint;
use crate::pipeline::chunk::{is_blank, split_chunks};
use crate::pipeline::input::sanitize_filename;
use crate::pipeline::parse::parse_json_array;
use crate::progress::{PipelineProgressCallback, Stage};
use crate::record::{TextRecord, VisualRecord};
use crate::services::gemini::{
    GenerateRequest, GenerateResponse, GenerativeModel, Part, Turn, UploadedFile,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Model turn placed between the instructions and the chunk body.
pub const CHUNK_ACKNOWLEDGEMENT: &str =
    "Understood. Send the text chunk and I will answer with the JSON array only.";

fn credential_error(e: ServiceError) -> Pdf2AnkiError {
    match e {
        ServiceError::InvalidCredential => Pdf2AnkiError::MissingApiKey,
        other => Pdf2AnkiError::Service(other),
    }
}

// ── Visual ───────────────────────────────────────────────────────────────

/// Outcome of [`extract_visual`].
///
/// `upload` is set whenever the upload succeeded, even if a later step
/// failed, so the caller can always clean it up.
#[derive(Debug)]
pub struct VisualExtraction {
    pub result: Result<Vec<VisualRecord>, Pdf2AnkiError>,
    pub upload: Option<UploadedFile>,
}

/// Upload `pdf_path` and extract every question/answer pair from it.
///
/// `Ok(vec![])` means the model answered with nothing; every kind of
/// failure is an `Err` in [`VisualExtraction::result`].
pub async fn extract_visual(
    model: &dyn GenerativeModel,
    pdf_path: &Path,
    model_name: &str,
    prompt: &str,
    checkpoint: Option<&Checkpoint>,
) -> VisualExtraction {
    if let Err(e) = model.check_credentials() {
        return VisualExtraction {
            result: Err(credential_error(e)),
            upload: None,
        };
    }

    let display_name = format!(
        "visual-extract-{}-{}",
        sanitize_filename(pdf_path),
        chrono::Utc::now().timestamp()
    );
    info!("Uploading {} as '{}'", pdf_path.display(), display_name);
    let file = match model.upload(pdf_path, &display_name).await {
        Ok(file) => file,
        Err(e) => {
            error!("Upload of {} failed: {}", pdf_path.display(), e);
            return VisualExtraction {
                result: Err(e.into()),
                upload: None,
            };
        }
    };
    debug!("Uploaded as {} ({})", file.name, file.uri);

    let request = GenerateRequest {
        model: model_name.to_string(),
        system_instruction: None,
        turns: vec![Turn::user(vec![
            Part::Text(prompt.to_string()),
            Part::from(&file),
        ])],
        json_output: true,
    };

    let result = visual_records(model, &request, pdf_path, checkpoint).await;
    VisualExtraction {
        result,
        upload: Some(file),
    }
}

async fn visual_records(
    model: &dyn GenerativeModel,
    request: &GenerateRequest,
    pdf_path: &Path,
    checkpoint: Option<&Checkpoint>,
) -> Result<Vec<VisualRecord>, Pdf2AnkiError> {
    info!("Requesting Q/A extraction from {}", request.model);
    let response = model.generate(request).await?;

    if response.is_fully_blocked() {
        let reason = response.block_reason.unwrap_or_default();
        error!("Extraction for {} was blocked ({})", pdf_path.display(), reason);
        return Err(Pdf2AnkiError::Blocked { reason });
    }
    if let Some(reason) = &response.block_reason {
        warn!(
            "Prompt flagged ({}) but the model finished with {:?}; parsing what came back",
            reason, response.finish_reason
        );
    }

    let text = response.text.ok_or(Pdf2AnkiError::NoResponseText)?;
    if text.trim().is_empty() {
        warn!("Model returned an empty answer for {}", pdf_path.display());
        return Ok(Vec::new());
    }

    let items = parse_json_array(&text)?;
    let total = items.len();
    let records: Vec<VisualRecord> = items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| match VisualRecord::from_value(item) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("Dropping item {} of the extraction: {}", i + 1, e);
                None
            }
        })
        .collect();

    info!("Extracted {} of {} items as records", records.len(), total);
    if let Some(cp) = checkpoint {
        cp.save_json("visual_extract", &records).await;
    }
    Ok(records)
}

/// Delete an uploaded file. Failures are only logged.
pub async fn cleanup_upload(model: &dyn GenerativeModel, file: &UploadedFile) {
    match model.delete(file).await {
        Ok(()) => info!("Deleted uploaded file {}", file.name),
        Err(ServiceError::Unsupported(_)) => {
            debug!("Model backend keeps uploads; {} left in place", file.name)
        }
        Err(e) => warn!("Could not delete uploaded file {}: {}", file.name, e),
    }
}

// ── Text ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TextExtractionOptions {
    pub model: String,
    pub prompt: String,
    /// Characters per chunk.
    pub chunk_size: usize,
    /// Pause between two model calls.
    pub delay: Duration,
}

/// Extract question/answer pairs from `text`, one model call per chunk.
///
/// Blank chunks are skipped without a call. A recoverable provider error,
/// a blocked answer or unparseable JSON skips its chunk. Any other provider
/// error aborts the call and the records gathered so far are lost (they
/// survive only in the checkpoint).
pub async fn extract_text(
    model: &dyn GenerativeModel,
    text: &str,
    options: &TextExtractionOptions,
    checkpoint: Option<&Checkpoint>,
    progress: &dyn PipelineProgressCallback,
) -> Result<Vec<TextRecord>, Pdf2AnkiError> {
    model.check_credentials().map_err(credential_error)?;

    let chunks = split_chunks(text, options.chunk_size);
    let total = chunks.len();
    info!(
        "Text extraction: {} chars in {} chunks of up to {}",
        text.chars().count(),
        total,
        options.chunk_size
    );
    progress.on_stage_start(Stage::TextExtraction, Some(total));

    let mut records: Vec<TextRecord> = Vec::new();
    let mut called = false;

    for (i, chunk) in chunks.iter().enumerate() {
        let n = i + 1;
        if is_blank(chunk) {
            debug!("Chunk {}/{} is blank; skipped", n, total);
            progress.on_chunk_complete(n, total, 0);
            continue;
        }

        if called && !options.delay.is_zero() {
            debug!("Waiting {:?} before chunk {}", options.delay, n);
            tokio::time::sleep(options.delay).await;
        }
        called = true;

        let request = GenerateRequest {
            model: options.model.clone(),
            system_instruction: None,
            turns: vec![
                Turn::user_text(options.prompt.clone()),
                Turn::model_text(CHUNK_ACKNOWLEDGEMENT),
                Turn::user_text(format!("--- Text Chunk ---\n{}", chunk)),
            ],
            json_output: true,
        };

        info!("Chunk {}/{}: sending {} chars", n, total, chunk.chars().count());
        let added = match model.generate(&request).await {
            Ok(response) => chunk_records(n, total, response, &mut records),
            Err(e) if e.is_recoverable() => {
                warn!("Chunk {}/{}: model call failed, skipping: {}", n, total, e);
                0
            }
            Err(e) => {
                error!(
                    "Chunk {}/{}: unexpected failure, aborting text extraction: {}",
                    n, total, e
                );
                return Err(e.into());
            }
        };

        if added > 0 {
            if let Some(cp) = checkpoint {
                cp.save_json("text_analysis", &records).await;
            }
        }
        progress.on_chunk_complete(n, total, added);
    }

    info!("Text extraction finished: {} records", records.len());
    if let Some(cp) = checkpoint {
        cp.save_json("text_analysis_final", &records).await;
    }
    Ok(records)
}

/// Append the valid records of one chunk's answer; returns how many.
fn chunk_records(
    n: usize,
    total: usize,
    response: GenerateResponse,
    records: &mut Vec<TextRecord>,
) -> usize {
    if response.is_fully_blocked() {
        warn!(
            "Chunk {}/{}: blocked ({}), skipping",
            n,
            total,
            response.block_reason.as_deref().unwrap_or("unknown")
        );
        return 0;
    }
    let Some(text) = response.text.filter(|t| !t.trim().is_empty()) else {
        warn!("Chunk {}/{}: empty answer, skipping", n, total);
        return 0;
    };
    let items = match parse_json_array(&text) {
        Ok(items) => items,
        Err(e) => {
            warn!("Chunk {}/{}: {}, skipping", n, total, e);
            return 0;
        }
    };

    let before = records.len();
    records.extend(items.iter().filter_map(TextRecord::from_value));
    let added = records.len() - before;
    if added < items.len() {
        warn!(
            "Chunk {}/{}: dropped {} item(s) without question and answer",
            n,
            total,
            items.len() - added
        );
    }
    debug!("Chunk {}/{}: {} records", n, total, added);
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgressCallback;
    use crate::services::gemini::FinishReason;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        credentials: Result<(), ServiceError>,
        answers: Mutex<VecDeque<Result<GenerateResponse, ServiceError>>>,
        requests: Mutex<Vec<GenerateRequest>>,
        uploads: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<GenerateResponse, ServiceError>>) -> Self {
            Self {
                credentials: Ok(()),
                answers: Mutex::new(answers.into()),
                requests: Mutex::new(Vec::new()),
                uploads: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerativeModel for Scripted {
        fn check_credentials(&self) -> Result<(), ServiceError> {
            self.credentials.clone()
        }

        async fn upload(&self, _path: &Path, display_name: &str) -> Result<UploadedFile, ServiceError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(UploadedFile {
                name: format!("files/{display_name}"),
                uri: "https://example.invalid/f".into(),
                mime_type: "application/pdf".into(),
            })
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ServiceError> {
            self.requests.lock().unwrap().push(request.clone());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(GenerateResponse::text("[]")))
        }
    }

    const ONE_RECORD: &str = r#"[{"question_page": 1, "question_text": "Q",
        "relevant_question_image_pages": [], "answer_page": 2, "answer_text": "A",
        "relevant_answer_image_pages": [2]}]"#;

    fn options(chunk_size: usize) -> TextExtractionOptions {
        TextExtractionOptions {
            model: "m".into(),
            prompt: "extract".into(),
            chunk_size,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn visual_fenced_answer_is_parsed_and_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpoint::new(dir.path(), "deck");
        let model = Scripted::new(vec![Ok(GenerateResponse::text(format!(
            "```json\n{ONE_RECORD}\n```"
        )))]);

        let out = extract_visual(&model, Path::new("deck.pdf"), "m", "go", Some(&cp)).await;
        let records = out.result.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer_text, "A");
        assert!(out.upload.is_some());
        assert!(dir.path().join("deck_visual_extract_temp_results.json").exists());

        let req = &model.requests.lock().unwrap()[0];
        assert!(req.json_output);
        assert!(req.turns[0].parts.iter().any(|p| matches!(p, Part::File { .. })));
    }

    #[tokio::test]
    async fn visual_bad_key_fails_before_upload() {
        let mut model = Scripted::new(vec![]);
        model.credentials = Err(ServiceError::InvalidCredential);
        let out = extract_visual(&model, Path::new("deck.pdf"), "m", "go", None).await;
        assert!(matches!(out.result, Err(Pdf2AnkiError::MissingApiKey)));
        assert!(out.upload.is_none());
        assert_eq!(model.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn visual_block_handling() {
        let model = Scripted::new(vec![Ok(GenerateResponse::blocked("SAFETY"))]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert!(matches!(out.result, Err(Pdf2AnkiError::Blocked { .. })));
        assert!(out.upload.is_some());

        let partial = GenerateResponse {
            text: Some(ONE_RECORD.into()),
            block_reason: Some("OTHER".into()),
            finish_reason: Some(FinishReason::Stop),
        };
        let model = Scripted::new(vec![Ok(partial)]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert_eq!(out.result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn visual_empty_versus_broken() {
        let model = Scripted::new(vec![Ok(GenerateResponse::text("  "))]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert!(out.result.unwrap().is_empty());

        let model = Scripted::new(vec![Ok(GenerateResponse::text("not json"))]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert!(matches!(out.result, Err(Pdf2AnkiError::Parse(_))));

        let model = Scripted::new(vec![Ok(GenerateResponse::default())]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert!(matches!(out.result, Err(Pdf2AnkiError::NoResponseText)));
    }

    #[tokio::test]
    async fn visual_drops_incomplete_items() {
        let body = r#"[{"question_text": "only a question"},
            {"question_page": 1, "question_text": "Q", "relevant_question_image_pages": [],
             "answer_page": 1, "answer_text": "A", "relevant_answer_image_pages": []}]"#;
        let model = Scripted::new(vec![Ok(GenerateResponse::text(body))]);
        let out = extract_visual(&model, Path::new("d.pdf"), "m", "go", None).await;
        assert_eq!(out.result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn text_chunks_use_three_turns() {
        let model = Scripted::new(vec![Ok(GenerateResponse::text(
            r#"[{"question": "q", "answer": "a"}]"#,
        ))]);
        let out = extract_text(&model, "hello", &options(100), None, &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);

        let req = &model.requests.lock().unwrap()[0];
        assert_eq!(req.turns.len(), 3);
        assert_eq!(req.turns[1].text(), CHUNK_ACKNOWLEDGEMENT);
        assert_eq!(req.turns[2].text(), "--- Text Chunk ---\nhello");
    }

    #[tokio::test]
    async fn recoverable_chunk_failure_is_skipped() {
        let model = Scripted::new(vec![
            Ok(GenerateResponse::text(r#"[{"question": "q1", "answer": "a1"}]"#)),
            Err(ServiceError::Transport("reset".into())),
            Ok(GenerateResponse::text(r#"[{"question": "q3", "answer": "a3"}, {"q": 1}]"#)),
        ]);
        let out = extract_text(&model, "aaaabbbbcccc", &options(4), None, &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(model.calls(), 3);
        let questions: Vec<&str> = out.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(questions, vec!["q1", "q3"]);
    }

    #[tokio::test]
    async fn unexpected_chunk_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpoint::new(dir.path(), "notes");
        let model = Scripted::new(vec![
            Ok(GenerateResponse::text(r#"[{"question": "q1", "answer": "a1"}]"#)),
            Err(ServiceError::UnexpectedResponse("no candidates".into())),
        ]);
        let err = extract_text(&model, "aaaabbbbcccc", &options(4), Some(&cp), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2AnkiError::Service(_)));
        assert_eq!(model.calls(), 2);
        assert!(dir.path().join("notes_text_analysis_temp_results.json").exists());
        assert!(!dir.path().join("notes_text_analysis_final_temp_results.json").exists());
    }

    #[tokio::test]
    async fn blank_chunks_cost_no_call() {
        let model = Scripted::new(vec![]);
        extract_text(&model, "abcd    efgh", &options(4), None, &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn text_bad_key_is_fatal() {
        let mut model = Scripted::new(vec![]);
        model.credentials = Err(ServiceError::InvalidCredential);
        let err = extract_text(&model, "text", &options(4), None, &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2AnkiError::MissingApiKey));
        assert_eq!(model.calls(), 0);
    }
}
