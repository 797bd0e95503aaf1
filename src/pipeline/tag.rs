//! Tagging caller: classify table rows against a taxonomy, batch by batch.
//!
//! ```text
//! TagTable ──▶ batches of N rows ──▶ "[i] f1 | f2 | ..." ──▶ model
//!                                                             │
//!     rows with new Tags ◀── parse_tag_lines (N slots) ◀───┘
//! ```
//!
//! The first pass overwrites whatever `Tags` held; later passes merge into
//! it (see [`merge_tags`]).
//!
//! A pass never fails as a whole: every input row comes out exactly once,
//! with an `ERROR: ...` sentinel in `Tags` when its batch could not be
//! tagged. Rows are produced as a stream so the final pass can be written
//! to disk without holding the tagged table in memory.

use crate::error::{Pdf2AnkiError, ServiceError};
use crate::pipeline::assemble::{render_row, tmp_sibling};
use crate::pipeline::checkpoint::Checkpoint;
use crate::pipeline::parse::{parse_tag_lines, PARSING_MISMATCH};
use crate::pipeline::taxonomy::Taxonomy;
use crate::progress::{NoopProgressCallback, ProgressCallback, Stage};
use crate::services::gemini::{GenerateRequest, GenerativeModel, Turn};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

pub const TAGS_COLUMN: &str = "Tags";

// ── Sentinels ────────────────────────────────────────────────────────────

pub const API_KEY_FAILED: &str = "ERROR: API Key Config Failed";
pub const NO_TEXT_IN_RESPONSE: &str = "ERROR: No Text in API Response";

pub fn api_call_failed(kind: &str) -> String {
    format!("ERROR: API Call Failed ({})", kind)
}

pub fn blocked_by_api(reason: &str) -> String {
    format!("ERROR: Blocked by API ({})", reason)
}

pub fn unexpected_failure(kind: &str) -> String {
    format!("ERROR: Unexpected API Call Failure ({})", kind)
}

/// `true` for `ERROR: ...` / `INFO: ...` markers, which are not real tags.
pub fn is_sentinel(tags: &str) -> bool {
    let t = tags.trim_start();
    t.starts_with("ERROR:") || t.starts_with("INFO:")
}

/// Combine the tags a row already has with the tags of a new pass.
///
/// Real tags accumulate (existing order first, duplicates dropped). A
/// sentinel never displaces real tags, real tags replace a sentinel, and of
/// two sentinels the newer one wins. An empty result keeps what was there.
pub fn merge_tags(existing: &str, new: &str) -> String {
    let existing = existing.trim();
    let new = new.trim();
    if new.is_empty() {
        return existing.to_string();
    }
    if existing.is_empty() {
        return new.to_string();
    }
    if is_sentinel(new) {
        let keep = if is_sentinel(existing) { new } else { existing };
        return keep.to_string();
    }
    if is_sentinel(existing) {
        return new.to_string();
    }

    let mut merged: Vec<&str> = existing.split_whitespace().collect();
    for tag in new.split_whitespace() {
        if !merged.contains(&tag) {
            merged.push(tag);
        }
    }
    merged.join(" ")
}

// ── Table ────────────────────────────────────────────────────────────────

/// Header plus data rows, the unit the tagger and the TSV writer exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TagTable {
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { header, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the `Tags` column, if the header has one.
    pub fn tags_column(&self) -> Option<usize> {
        self.header.iter().position(|h| h.trim() == TAGS_COLUMN)
    }

    /// Locate or append the `Tags` column and force every row to the header
    /// width (pad with empty fields or truncate).
    pub fn with_tags_column(mut self) -> (Self, usize) {
        let idx = match self.tags_column() {
            Some(idx) => idx,
            None => {
                self.header.push(TAGS_COLUMN.to_string());
                self.header.len() - 1
            }
        };
        let width = self.header.len();
        for row in &mut self.rows {
            if row.len() != width {
                row.resize(width, String::new());
            }
        }
        (self, idx)
    }

    /// Append another table's rows, matching columns by header name.
    /// Columns this table lacks are dropped, missing ones are left empty.
    pub fn extend_aligned(&mut self, other: TagTable) {
        let mapping: Vec<Option<usize>> = self
            .header
            .iter()
            .map(|h| other.header.iter().position(|o| o == h))
            .collect();
        self.rows.extend(other.rows.into_iter().map(|row| {
            mapping
                .iter()
                .map(|src| src.and_then(|i| row.get(i).cloned()).unwrap_or_default())
                .collect()
        }));
    }
}

/// The request line for one row: `[n] field | field | ...`. With
/// `initial_tags`, the row's current real tags are appended as context.
fn batch_line(n: usize, row: &[String], tags_idx: usize, initial_tags: bool) -> String {
    let fields = row
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != tags_idx)
        .map(|(_, v)| v.as_str())
        .collect::<Vec<_>>()
        .join(" | ");
    let mut line = format!("[{}] {}", n, fields);
    let existing = row.get(tags_idx).map(|t| t.trim()).unwrap_or_default();
    if initial_tags && !existing.is_empty() && !is_sentinel(existing) {
        line.push_str(" | Initial Tags: ");
        line.push_str(existing);
    }
    line
}

// ── Pass configuration ───────────────────────────────────────────────────

/// One tagging pass: which model, which instructions, which tags are legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggingPass {
    pub label: String,
    pub model: String,
    pub prompt: String,
    pub taxonomy: Taxonomy,
}

impl TaggingPass {
    /// The taxonomy is derived from the `#tags` in `prompt`.
    pub fn new(label: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let taxonomy = Taxonomy::from_prompt(&prompt);
        Self {
            label: label.into(),
            model: model.into(),
            prompt,
            taxonomy,
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }
}

// ── Tagger ───────────────────────────────────────────────────────────────

/// Runs tagging passes over a [`TagTable`].
#[derive(Clone)]
pub struct Tagger {
    model: Arc<dyn GenerativeModel>,
    batch_size: usize,
    delay: Duration,
    checkpoint: Option<Checkpoint>,
    progress: ProgressCallback,
}

impl std::fmt::Debug for Tagger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tagger")
            .field("batch_size", &self.batch_size)
            .field("delay", &self.delay)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

impl Tagger {
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

    pub fn new(model: Arc<dyn GenerativeModel>) -> Self {
        Self {
            model,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            delay: Self::DEFAULT_DELAY,
            checkpoint: None,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Rows per model call. Zero is treated as one.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    /// Pause before every batch except the first.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = cb;
        self
    }

    /// Tag `table` with one pass, producing rows as their batch completes.
    ///
    /// The returned header is final immediately. `pass_number` (1-based)
    /// labels logs, progress events and the `tagging_pass{n}` checkpoint.
    /// Pass 1 overwrites the `Tags` cell; later passes merge into it.
    pub fn stream(&self, table: TagTable, pass: &TaggingPass, pass_number: usize) -> TaggedRows {
        let (table, tags_idx) = table.with_tags_column();
        let total = table.rows.len();
        let total_batches = total.div_ceil(self.batch_size);

        let credentials_ok = match self.model.check_credentials() {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Pass {} ({}): API key check failed ({}); all {} rows get '{}'",
                    pass_number, pass.label, e, total, API_KEY_FAILED
                );
                false
            }
        };

        info!(
            "Pass {} ({}): tagging {} rows in {} batches with {}",
            pass_number, pass.label, total, total_batches, pass.model
        );
        self.progress
            .on_stage_start(Stage::Tagging(pass_number), Some(total_batches));

        let state = PassState {
            tagger: self.clone(),
            pass: pass.clone(),
            pass_number,
            header: table.header.clone(),
            tags_idx,
            pending: table.rows.into(),
            ready: VecDeque::new(),
            done: Vec::new(),
            processed: 0,
            total,
            batch: 0,
            total_batches,
            credentials_ok,
            fatal: None,
        };

        let rows = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(row) = st.ready.pop_front() {
                    return Some((row, st));
                }
                if st.pending.is_empty() {
                    return None;
                }
                st.next_batch().await;
            }
        })
        .boxed();

        TaggedRows {
            header: table.header,
            rows,
        }
    }

    /// Apply `passes` in order. The first replaces any existing tags, each
    /// later one merges into the previous result. With no passes the table only gains a `Tags` column.
    pub async fn run(&self, table: TagTable, passes: &[TaggingPass]) -> TagTable {
        let mut table = table;
        for (i, pass) in passes.iter().enumerate() {
            table = self.stream(table, pass, i + 1).into_table().await;
        }
        table.with_tags_column().0
    }

    /// Run `passes` and stream the last one straight into `path`.
    ///
    /// Rows go to a sibling `.tmp` file that is renamed over `path` at the
    /// end. Returns the number of data rows written.
    pub async fn write(
        &self,
        table: TagTable,
        passes: &[TaggingPass],
        path: &Path,
    ) -> Result<usize, Pdf2AnkiError> {
        let mut rows = match passes.split_last() {
            Some((last, earlier)) => {
                let table = self.run(table, earlier).await;
                self.stream(table, last, passes.len())
            }
            None => TaggedRows::ready(table),
        };

        let write_err = |e: std::io::Error| Pdf2AnkiError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let tmp = tmp_sibling(path);
        let file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        let mut out = tokio::io::BufWriter::new(file);
        out.write_all(render_row(rows.header()).as_bytes())
            .await
            .map_err(write_err)?;

        let mut count = 0;
        while let Some(row) = rows.next().await {
            out.write_all(render_row(&row).as_bytes())
                .await
                .map_err(write_err)?;
            count += 1;
        }
        out.flush().await.map_err(write_err)?;
        drop(out);

        tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
        info!("Wrote {} tagged rows to {}", count, path.display());
        Ok(count)
    }
}

// ── Stream ───────────────────────────────────────────────────────────────

/// Header plus a stream of tagged rows. Restartable only by tagging again.
pub struct TaggedRows {
    header: Vec<String>,
    rows: BoxStream<'static, Vec<String>>,
}

impl TaggedRows {
    /// Untagged rows passed through unchanged (with a `Tags` column).
    pub fn ready(table: TagTable) -> Self {
        let (table, _) = table.with_tags_column();
        Self {
            header: table.header,
            rows: stream::iter(table.rows).boxed(),
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Drain the stream into a table.
    pub async fn into_table(self) -> TagTable {
        let TaggedRows { header, rows } = self;
        let rows: Vec<Vec<String>> = rows.collect().await;
        TagTable::new(header, rows)
    }
}

impl Stream for TaggedRows {
    type Item = Vec<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rows.poll_next_unpin(cx)
    }
}

/// Mutable state of one pass while its stream is being polled.
struct PassState {
    tagger: Tagger,
    pass: TaggingPass,
    pass_number: usize,
    header: Vec<String>,
    tags_idx: usize,
    pending: VecDeque<Vec<String>>,
    ready: VecDeque<Vec<String>>,
    /// Rows emitted so far; kept only for the checkpoint snapshot.
    done: Vec<Vec<String>>,
    processed: usize,
    total: usize,
    batch: usize,
    total_batches: usize,
    credentials_ok: bool,
    /// Set after a non-recoverable failure: no further calls this pass.
    fatal: Option<&'static str>,
}

impl PassState {
    async fn next_batch(&mut self) {
        let take = self.pending.len().min(self.tagger.batch_size);
        let mut batch: Vec<Vec<String>> = self.pending.drain(..take).collect();
        self.batch += 1;

        let tags = self.tags_for(&batch).await;
        for (row, new) in batch.iter_mut().zip(tags) {
            let cell = &mut row[self.tags_idx];
            *cell = if self.credentials_ok && self.pass_number > 1 {
                merge_tags(cell, &new)
            } else {
                new
            };
        }

        self.processed += batch.len();
        self.tagger
            .progress
            .on_batch_complete(self.pass_number, self.processed, self.total);

        if let Some(checkpoint) = &self.tagger.checkpoint {
            self.done.extend(batch.iter().cloned());
            checkpoint
                .save_tsv(
                    &format!("tagging_pass{}", self.pass_number),
                    &self.header,
                    &self.done,
                )
                .await;
        }
        self.ready.extend(batch);
    }

    async fn tags_for(&mut self, batch: &[Vec<String>]) -> Vec<String> {
        let n = batch.len();
        if !self.credentials_ok {
            return vec![API_KEY_FAILED.to_string(); n];
        }
        if let Some(kind) = self.fatal {
            return vec![unexpected_failure(kind); n];
        }

        if self.batch > 1 && !self.tagger.delay.is_zero() {
            debug!("Waiting {:?} before next batch", self.tagger.delay);
            tokio::time::sleep(self.tagger.delay).await;
        }

        let label = format!(
            "pass {} batch {}/{}",
            self.pass_number, self.batch, self.total_batches
        );
        let lines = batch
            .iter()
            .enumerate()
            .map(|(i, row)| batch_line(i + 1, row, self.tags_idx, self.pass_number > 1))
            .collect::<Vec<_>>()
            .join("\n");
        let request = GenerateRequest {
            model: self.pass.model.clone(),
            system_instruction: Some(self.pass.prompt.clone()),
            turns: vec![Turn::user_text(lines)],
            json_output: false,
        };

        info!("Tagging {} ({} rows)", label, n);
        match self.tagger.model.generate(&request).await {
            Ok(resp) if resp.is_fully_blocked() => {
                let reason = resp.block_reason.unwrap_or_default();
                warn!("{}: blocked by provider ({})", label, reason);
                vec![blocked_by_api(&reason); n]
            }
            Ok(resp) => {
                if let Some(reason) = &resp.block_reason {
                    warn!("{}: partially blocked ({}); using the text anyway", label, reason);
                }
                match resp.text {
                    Some(text) => {
                        let tags = parse_tag_lines(&text, n, &self.pass.taxonomy);
                        let missing = tags.iter().filter(|t| *t == PARSING_MISMATCH).count();
                        if missing > 0 {
                            warn!("{}: {} of {} rows missing from the answer", label, missing, n);
                        }
                        tags
                    }
                    None => {
                        warn!("{}: response carried no text", label);
                        vec![NO_TEXT_IN_RESPONSE.to_string(); n]
                    }
                }
            }
            Err(ServiceError::Blocked { reason }) => {
                warn!("{}: blocked by provider ({})", label, reason);
                vec![blocked_by_api(&reason); n]
            }
            Err(e) if e.is_recoverable() => {
                warn!("{}: model call failed: {}", label, e);
                vec![api_call_failed(e.kind()); n]
            }
            Err(e) => {
                error!(
                    "{}: unexpected failure ({}); the remaining rows of this pass are not sent",
                    label, e
                );
                self.fatal = Some(e.kind());
                vec![unexpected_failure(e.kind()); n]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gemini::GenerateResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers `[i] <tag>` for every request line unless a scripted
    /// response is queued.
    struct EchoModel {
        tag: &'static str,
        credentials: Result<(), ServiceError>,
        script: Mutex<VecDeque<Result<GenerateResponse, ServiceError>>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl EchoModel {
        fn new(tag: &'static str) -> Self {
            Self {
                tag,
                credentials: Ok(()),
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn then(self, response: Result<GenerateResponse, ServiceError>) -> Self {
            self.script.lock().unwrap().push_back(response);
            self
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerativeModel for EchoModel {
        fn check_credentials(&self) -> Result<(), ServiceError> {
            self.credentials.clone()
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ServiceError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(scripted) = self.script.lock().unwrap().pop_front() {
                return scripted;
            }
            let body = request.turns[0].text();
            let answer = (1..=body.lines().count())
                .map(|i| format!("[{}] {}", i, self.tag))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(GenerateResponse::text(answer))
        }
    }

    fn table(n: usize) -> TagTable {
        TagTable::new(
            vec!["Question".into(), "Answer".into()],
            (0..n).map(|i| vec![format!("q{i}"), format!("a{i}")]).collect(),
        )
    }

    fn tagger(model: Arc<EchoModel>, batch: usize) -> Tagger {
        Tagger::new(model).batch_size(batch).delay(Duration::ZERO)
    }

    fn pass(model: &str) -> TaggingPass {
        TaggingPass::new("test", model, "Use {#a #b #c}").with_taxonomy(Taxonomy::empty())
    }

    #[test]
    fn merge_rules() {
        assert_eq!(merge_tags("", "#a"), "#a");
        assert_eq!(merge_tags("#a #b", ""), "#a #b");
        assert_eq!(merge_tags("#a #b", "#b #c"), "#a #b #c");
        assert_eq!(merge_tags("#a", PARSING_MISMATCH), "#a");
        assert_eq!(merge_tags(PARSING_MISMATCH, "#a"), "#a");
        assert_eq!(merge_tags(PARSING_MISMATCH, API_KEY_FAILED), API_KEY_FAILED);
    }

    #[test]
    fn tags_column_is_appended_and_rows_made_rectangular() {
        let t = TagTable::new(
            vec!["Q".into(), "A".into()],
            vec![vec!["q".into()], vec!["q".into(), "a".into(), "extra".into()]],
        );
        let (t, idx) = t.with_tags_column();
        assert_eq!(idx, 2);
        assert_eq!(t.header, vec!["Q", "A", "Tags"]);
        assert!(t.rows.iter().all(|r| r.len() == 3));
        assert_eq!(t.rows[1][2], "");
    }

    #[test]
    fn existing_tags_column_is_reused() {
        let t = TagTable::new(
            vec!["Tags".into(), "Q".into()],
            vec![vec!["#x".into(), "q".into()]],
        );
        let (t, idx) = t.with_tags_column();
        assert_eq!(idx, 0);
        assert_eq!(t.header.len(), 2);
    }

    #[test]
    fn batch_line_carries_real_initial_tags_only() {
        let row = vec!["q".to_string(), "a".to_string(), "#x".to_string()];
        assert_eq!(batch_line(3, &row, 2, true), "[3] q | a | Initial Tags: #x");
        assert_eq!(batch_line(3, &row, 2, false), "[3] q | a");
        let row = vec!["q".to_string(), "a".to_string(), API_KEY_FAILED.to_string()];
        assert_eq!(batch_line(1, &row, 2, true), "[1] q | a");
    }

    #[test]
    fn aligned_extend_matches_by_name() {
        let mut t = TagTable::new(vec!["A".into(), "B".into()], vec![]);
        t.extend_aligned(TagTable::new(
            vec!["B".into(), "C".into()],
            vec![vec!["b".into(), "c".into()]],
        ));
        assert_eq!(t.rows, vec![vec!["".to_string(), "b".to_string()]]);
    }

    #[tokio::test]
    async fn twelve_rows_in_batches_of_five() {
        let model = Arc::new(EchoModel::new("#a"));
        let out = tagger(model.clone(), 5).run(table(12), &[pass("m")]).await;

        assert_eq!(model.calls(), 3);
        assert_eq!(out.rows.len(), 12);
        assert!(out.rows.iter().all(|r| r.len() == out.header.len()));
        assert!(out.rows.iter().all(|r| r[2] == "#a"));

        let sizes: Vec<usize> = model
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.turns[0].text().lines().count())
            .collect();
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[tokio::test]
    async fn bad_credentials_tag_every_row_without_calls() {
        let mut model = EchoModel::new("#a");
        model.credentials = Err(ServiceError::InvalidCredential);
        let model = Arc::new(model);

        let out = tagger(model.clone(), 5).run(table(7), &[pass("m")]).await;
        assert_eq!(model.calls(), 0);
        assert_eq!(out.rows.len(), 7);
        assert!(out.rows.iter().all(|r| r[2] == API_KEY_FAILED));
    }

    #[tokio::test]
    async fn recoverable_failure_only_costs_its_batch() {
        let model = Arc::new(
            EchoModel::new("#a")
                .then(Ok(GenerateResponse::text("[1] #a\n[2] #a")))
                .then(Err(ServiceError::Http {
                    status: 503,
                    body: "busy".into(),
                })),
        );
        let out = tagger(model.clone(), 2).run(table(6), &[pass("m")]).await;

        assert_eq!(model.calls(), 3);
        let tags: Vec<&str> = out.rows.iter().map(|r| r[2].as_str()).collect();
        let failed = api_call_failed("Http");
        let failed = failed.as_str();
        assert_eq!(tags, vec!["#a", "#a", failed, failed, "#a", "#a"]);
    }

    #[tokio::test]
    async fn unexpected_failure_stops_further_calls() {
        let model = Arc::new(
            EchoModel::new("#a").then(Err(ServiceError::UnexpectedResponse("no candidates".into()))),
        );
        let out = tagger(model.clone(), 2).run(table(5), &[pass("m")]).await;

        assert_eq!(model.calls(), 1);
        let expected = unexpected_failure("UnexpectedResponse");
        assert!(out.rows.iter().all(|r| r[2] == expected));
    }

    #[tokio::test]
    async fn blocked_and_empty_responses_become_sentinels() {
        let model = Arc::new(
            EchoModel::new("#a")
                .then(Ok(GenerateResponse::blocked("SAFETY")))
                .then(Ok(GenerateResponse::default())),
        );
        let out = tagger(model, 1).run(table(2), &[pass("m")]).await;
        assert_eq!(out.rows[0][2], blocked_by_api("SAFETY"));
        assert_eq!(out.rows[1][2], NO_TEXT_IN_RESPONSE);
    }

    #[tokio::test]
    async fn second_pass_merges_and_sees_initial_tags() {
        let model = Arc::new(EchoModel::new("#b").then(Ok(GenerateResponse::text("[1] #a\n[2] #a\n[3] #a"))));
        let out = tagger(model.clone(), 5)
            .run(table(3), &[pass("m1"), pass("m2")])
            .await;

        assert!(out.rows.iter().all(|r| r[2] == "#a #b"));
        let requests = model.requests.lock().unwrap();
        let first = requests[0].turns[0].text();
        assert!(first.starts_with("[1] q0 | a0\n"), "got: {first}");
        let second = requests[1].turns[0].text();
        assert!(second.starts_with("[1] q0 | a0 | Initial Tags: #a"), "got: {second}");
    }

    fn pretagged() -> TagTable {
        TagTable::new(
            vec!["Question".into(), "Tags".into()],
            vec![vec!["q".into(), "#old".into()]],
        )
    }

    #[tokio::test]
    async fn first_pass_overwrites_existing_tags() {
        let model = Arc::new(EchoModel::new("#new"));
        let out = tagger(model.clone(), 5).run(pretagged(), &[pass("m")]).await;

        assert_eq!(out.header, vec!["Question", "Tags"]);
        assert_eq!(out.rows, vec![vec!["q".to_string(), "#new".to_string()]]);
        let sent = model.requests.lock().unwrap()[0].turns[0].text();
        assert_eq!(sent, "[1] q");
    }

    #[tokio::test]
    async fn first_pass_failure_replaces_existing_tags() {
        let model = Arc::new(EchoModel::new("#new").then(Err(ServiceError::Transport("reset".into()))));
        let out = tagger(model, 5).run(pretagged(), &[pass("m")]).await;

        assert_eq!(out.rows[0][1], "ERROR: API Call Failed (Transport)");
    }

    #[derive(Default)]
    struct RecordingProgress {
        batches: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl crate::progress::PipelineProgressCallback for RecordingProgress {
        fn on_batch_complete(&self, pass: usize, processed: usize, total: usize) {
            self.batches.lock().unwrap().push((pass, processed, total));
        }
    }

    #[tokio::test]
    async fn batch_progress_counts_rows_processed() {
        let model = Arc::new(EchoModel::new("#a"));
        let rec = Arc::new(RecordingProgress::default());
        tagger(model, 5)
            .progress(rec.clone())
            .run(table(12), &[pass("m")])
            .await;

        assert_eq!(
            *rec.batches.lock().unwrap(),
            vec![(1, 5, 12), (1, 10, 12), (1, 12, 12)]
        );
    }

    #[tokio::test]
    async fn batch_progress_labels_the_second_pass() {
        let model = Arc::new(EchoModel::new("#a"));
        let rec = Arc::new(RecordingProgress::default());
        tagger(model, 2)
            .progress(rec.clone())
            .run(table(3), &[pass("m1"), pass("m2")])
            .await;

        assert_eq!(
            *rec.batches.lock().unwrap(),
            vec![(1, 2, 3), (1, 3, 3), (2, 2, 3), (2, 3, 3)]
        );
    }

    #[tokio::test]
    async fn taxonomy_filters_invented_tags() {
        let model = Arc::new(EchoModel::new("#invented"));
        let strict = TaggingPass::new("strict", "m", "Pick from {#a #b}");
        let out = tagger(model, 5).run(table(1), &[strict]).await;
        assert_eq!(out.rows[0][2], crate::pipeline::parse::NO_VALID_TAGS);
    }

    #[tokio::test]
    async fn header_is_available_before_any_row() {
        let model = Arc::new(EchoModel::new("#a"));
        let mut rows = tagger(model.clone(), 5).stream(table(3), &pass("m"), 1);
        assert_eq!(rows.header().to_vec(), vec!["Question", "Answer", "Tags"]);
        assert_eq!(model.calls(), 0);
        assert!(rows.next().await.is_some());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn write_streams_final_pass_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(EchoModel::new("#a"));
        let out_path = dir.path().join("out.txt");
        let written = tagger(model, 2)
            .checkpoint(Checkpoint::new(dir.path(), "deck"))
            .write(table(3), &[pass("m")], &out_path)
            .await
            .unwrap();

        assert_eq!(written, 3);
        let text = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.starts_with("Question\tAnswer\tTags\n"));
        assert!(!dir.path().join("out.txt.tmp").exists());

        let checkpoint = std::fs::read_to_string(dir.path().join("deck_tagging_pass1_temp_results.tsv")).unwrap();
        assert_eq!(checkpoint.lines().count(), 4);
    }
}
