//! Note-store collaborator: the AnkiConnect add-on's JSON RPC bridge.
//!
//! Every call is `{action, params, version: 6}` POSTed to the add-on, which
//! answers `{result, error}`. A non-null `error` is a failure even when the
//! HTTP status is 200. Calls use a short fixed timeout because the bridge is
//! local and either answers at once or is not running.
//!
//! The typed helpers are provided methods on [`NoteStore`], so anything that
//! can `invoke` gets them for free.

use crate::error::Pdf2AnkiError;
use crate::pipeline::tag::TagTable;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ANKICONNECT_URL: &str = "http://127.0.0.1:8765";
pub const ANKICONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ANKICONNECT_VERSION: u32 = 6;

/// Pseudo-tag selecting notes without any tag.
pub const UNTAGGED: &str = "untagged";

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<]+?>").expect("valid regex"));

/// One field of a note as returned by `notesInfo`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NoteField {
    pub value: String,
    #[serde(default)]
    pub order: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteInfo {
    pub note_id: i64,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Absent for notes the add-on could not resolve.
    pub fields: Option<BTreeMap<String, NoteField>>,
}

/// Decks, tags and note types (with their field names) of the open profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnkiCollection {
    pub decks: Vec<String>,
    pub tags: Vec<String>,
    pub note_types: BTreeMap<String, Vec<String>>,
}

/// Which notes of a deck to export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportQuery {
    pub deck: String,
    /// Any of these (OR). [`UNTAGGED`] selects notes without tags.
    pub include_tags: Vec<String>,
    /// None of these.
    pub exclude_tags: Vec<String>,
}

impl ExportQuery {
    pub fn new(deck: impl Into<String>) -> Self {
        Self {
            deck: deck.into(),
            ..Self::default()
        }
    }

    /// Anki search string, e.g. `deck:"Bio" (tag:"a" OR tag:"b") -tag:"x"`.
    pub fn to_search(&self) -> String {
        let mut query = format!("deck:\"{}\"", self.deck);

        let untagged = self.include_tags.iter().any(|t| t == UNTAGGED);
        let mut include: Vec<String> = Vec::new();
        if untagged {
            include.push("tag:none".to_string());
        }
        include.extend(
            self.include_tags
                .iter()
                .filter(|t| t.as_str() != UNTAGGED)
                .map(|t| format!("tag:\"{t}\"")),
        );

        if untagged && include.len() == 1 {
            query.push_str(" tag:none");
        } else if !include.is_empty() {
            query.push_str(&format!(" ({})", include.join(" OR ")));
        }

        for tag in &self.exclude_tags {
            query.push_str(&format!(" -tag:\"{tag}\""));
        }
        query
    }
}

/// Flatten a note field to one TSV-safe line: HTML tags removed, line
/// breaks and tabs turned into spaces, trimmed.
pub fn clean_note_field(value: &str) -> String {
    HTML_TAG
        .replace_all(value, "")
        .replace(['\n', '\r', '\t'], " ")
        .trim()
        .to_string()
}

fn decode<T: DeserializeOwned + Default>(action: &str, value: Value) -> Result<T, Pdf2AnkiError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| Pdf2AnkiError::NoteStore {
        action: action.to_string(),
        message: format!("unexpected result: {e}"),
    })
}

/// A note store reachable through named actions.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Run one action and return its `result`.
    async fn invoke(&self, action: &str, params: Value) -> Result<Value, Pdf2AnkiError>;

    async fn deck_names(&self) -> Result<Vec<String>, Pdf2AnkiError> {
        decode("deckNames", self.invoke("deckNames", json!({})).await?)
    }

    async fn tags(&self) -> Result<Vec<String>, Pdf2AnkiError> {
        decode("getTags", self.invoke("getTags", json!({})).await?)
    }

    async fn model_names(&self) -> Result<Vec<String>, Pdf2AnkiError> {
        decode("modelNames", self.invoke("modelNames", json!({})).await?)
    }

    async fn model_field_names(&self, model: &str) -> Result<Vec<String>, Pdf2AnkiError> {
        let result = self
            .invoke("modelFieldNames", json!({ "modelName": model }))
            .await?;
        decode("modelFieldNames", result)
    }

    async fn find_notes(&self, query: &str) -> Result<Vec<i64>, Pdf2AnkiError> {
        decode("findNotes", self.invoke("findNotes", json!({ "query": query })).await?)
    }

    async fn notes_info(&self, ids: &[i64]) -> Result<Vec<NoteInfo>, Pdf2AnkiError> {
        decode("notesInfo", self.invoke("notesInfo", json!({ "notes": ids })).await?)
    }

    /// The profile's `collection.media` directory.
    async fn media_dir_path(&self) -> Result<PathBuf, Pdf2AnkiError> {
        let raw: String = decode("getMediaDirPath", self.invoke("getMediaDirPath", json!({})).await?)?;
        let path = PathBuf::from(raw);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Pdf2AnkiError::NoteStore {
                action: "getMediaDirPath".into(),
                message: format!("'{}' is not a directory", path.display()),
            })
        }
    }

    /// Decks, tags and every note type's fields. A note type whose fields
    /// cannot be read is left out with a warning.
    async fn load_collection(&self) -> Result<AnkiCollection, Pdf2AnkiError> {
        let decks = self.deck_names().await?;
        let tags = self.tags().await?;
        let mut note_types = BTreeMap::new();
        for model in self.model_names().await? {
            match self.model_field_names(&model).await {
                Ok(fields) if !fields.is_empty() => {
                    note_types.insert(model, fields);
                }
                Ok(_) => debug!("note type '{}' has no fields", model),
                Err(e) => warn!("could not read fields of note type '{}': {}", model, e),
            }
        }
        Ok(AnkiCollection {
            decks,
            tags,
            note_types,
        })
    }

    /// Export the selected `fields` of every note matching `query`.
    ///
    /// Notes without field data are skipped; a missing field becomes an
    /// empty cell.
    async fn export_notes(
        &self,
        query: &ExportQuery,
        fields: &[String],
    ) -> Result<TagTable, Pdf2AnkiError> {
        if fields.is_empty() {
            return Err(Pdf2AnkiError::InvalidConfig(
                "select at least one field to export".into(),
            ));
        }
        let search = query.to_search();
        debug!("Anki query: {}", search);

        let ids = self.find_notes(&search).await?;
        if ids.is_empty() {
            info!("No notes match {}", search);
            return Ok(TagTable::new(fields.to_vec(), Vec::new()));
        }

        let notes = self.notes_info(&ids).await?;
        let mut rows = Vec::with_capacity(notes.len());
        for note in notes {
            let Some(note_fields) = note.fields else {
                warn!("skipping note {}: no fields", note.note_id);
                continue;
            };
            let row = fields
                .iter()
                .map(|name| match note_fields.get(name) {
                    Some(f) => clean_note_field(&f.value),
                    None => {
                        warn!("note {} has no field '{}'", note.note_id, name);
                        String::new()
                    }
                })
                .collect();
            rows.push(row);
        }
        info!("Exported {} notes from deck '{}'", rows.len(), query.deck);
        Ok(TagTable::new(fields.to_vec(), rows))
    }
}

/// HTTP client for the AnkiConnect add-on.
#[derive(Debug, Clone)]
pub struct AnkiConnect {
    http: reqwest::Client,
    url: String,
}

impl AnkiConnect {
    pub fn new() -> Result<Self, Pdf2AnkiError> {
        Self::with_url(DEFAULT_ANKICONNECT_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Result<Self, Pdf2AnkiError> {
        let http = reqwest::Client::builder()
            .timeout(ANKICONNECT_TIMEOUT)
            .build()
            .map_err(|e| Pdf2AnkiError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `{result, error}` envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

fn open_envelope(action: &str, envelope: Envelope) -> Result<Value, Pdf2AnkiError> {
    match envelope.error {
        Value::Null => Ok(envelope.result),
        Value::String(message) => Err(Pdf2AnkiError::NoteStore {
            action: action.to_string(),
            message,
        }),
        other => Err(Pdf2AnkiError::NoteStore {
            action: action.to_string(),
            message: other.to_string(),
        }),
    }
}

#[async_trait]
impl NoteStore for AnkiConnect {
    async fn invoke(&self, action: &str, params: Value) -> Result<Value, Pdf2AnkiError> {
        let unavailable = |e: reqwest::Error| Pdf2AnkiError::NoteStoreUnavailable {
            url: self.url.clone(),
            detail: e.to_string(),
        };
        let body = json!({
            "action": action,
            "params": params,
            "version": ANKICONNECT_VERSION,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        let envelope: Envelope = resp.json().await.map_err(|e| Pdf2AnkiError::NoteStore {
            action: action.to_string(),
            message: format!("undecodable response: {e}"),
        })?;
        open_envelope(action, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers from a fixed action → result table and records calls.
    struct ScriptedStore {
        answers: BTreeMap<&'static str, Result<Value, String>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedStore {
        fn new(answers: Vec<(&'static str, Result<Value, String>)>) -> Self {
            Self {
                answers: answers.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NoteStore for ScriptedStore {
        async fn invoke(&self, action: &str, params: Value) -> Result<Value, Pdf2AnkiError> {
            self.calls
                .lock()
                .unwrap()
                .push((action.to_string(), params.clone()));
            match self.answers.get(action) {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(msg)) => Err(Pdf2AnkiError::NoteStore {
                    action: action.to_string(),
                    message: msg.clone(),
                }),
                None => Err(Pdf2AnkiError::NoteStore {
                    action: action.to_string(),
                    message: "unsupported action".into(),
                }),
            }
        }
    }

    #[test]
    fn search_string_variants() {
        let mut q = ExportQuery::new("Bio::Cells");
        assert_eq!(q.to_search(), r#"deck:"Bio::Cells""#);

        q.include_tags = vec!["a".into()];
        assert_eq!(q.to_search(), r#"deck:"Bio::Cells" (tag:"a")"#);

        q.include_tags = vec!["a".into(), "b".into()];
        q.exclude_tags = vec!["x".into(), "y".into()];
        assert_eq!(
            q.to_search(),
            r#"deck:"Bio::Cells" (tag:"a" OR tag:"b") -tag:"x" -tag:"y""#
        );
    }

    #[test]
    fn untagged_pseudo_tag() {
        let mut q = ExportQuery::new("D");
        q.include_tags = vec![UNTAGGED.into()];
        assert_eq!(q.to_search(), r#"deck:"D" tag:none"#);

        q.include_tags = vec!["a".into(), UNTAGGED.into()];
        assert_eq!(q.to_search(), r#"deck:"D" (tag:none OR tag:"a")"#);
    }

    #[test]
    fn note_fields_are_flattened() {
        assert_eq!(
            clean_note_field("<b>Mitosis</b><br>phase\tone\r\n "),
            "Mitosisphase one"
        );
    }

    #[test]
    fn envelope_error_field_is_an_error() {
        let err = open_envelope(
            "deckNames",
            Envelope {
                result: Value::Null,
                error: json!("collection is not available"),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("collection is not available"));

        let ok = open_envelope(
            "deckNames",
            Envelope {
                result: json!(["Default"]),
                error: Value::Null,
            },
        )
        .unwrap();
        assert_eq!(ok, json!(["Default"]));
    }

    #[tokio::test]
    async fn collection_tolerates_broken_note_type() {
        struct PartlyBroken;

        #[async_trait]
        impl NoteStore for PartlyBroken {
            async fn invoke(&self, action: &str, params: Value) -> Result<Value, Pdf2AnkiError> {
                match action {
                    "deckNames" => Ok(json!(["Default", "Bio"])),
                    "getTags" => Ok(json!(["#Card::HF"])),
                    "modelNames" => Ok(json!(["Basic", "Broken"])),
                    "modelFieldNames" if params["modelName"] == "Basic" => {
                        Ok(json!(["Front", "Back"]))
                    }
                    _ => Err(Pdf2AnkiError::NoteStore {
                        action: action.into(),
                        message: "model was not found".into(),
                    }),
                }
            }
        }

        let c = PartlyBroken.load_collection().await.unwrap();
        assert_eq!(c.decks, vec!["Default", "Bio"]);
        assert_eq!(c.tags, vec!["#Card::HF"]);
        assert_eq!(c.note_types.len(), 1);
        assert_eq!(c.note_types["Basic"], vec!["Front", "Back"]);
    }

    #[tokio::test]
    async fn export_builds_table() {
        let store = ScriptedStore::new(vec![
            ("findNotes", Ok(json!([11, 12, 13]))),
            (
                "notesInfo",
                Ok(json!([
                    {"noteId": 11, "modelName": "Basic", "tags": [],
                     "fields": {"Front": {"value": "<i>Q1</i>", "order": 0},
                                "Back": {"value": "A1\nmore", "order": 1}}},
                    {"noteId": 12, "modelName": "Basic", "tags": [],
                     "fields": {"Front": {"value": "Q2", "order": 0}}},
                    {"noteId": 13}
                ])),
            ),
        ]);

        let mut q = ExportQuery::new("Bio");
        q.include_tags = vec!["a".into()];
        let fields = vec!["Front".to_string(), "Back".to_string()];
        let table = store.export_notes(&q, &fields).await.unwrap();

        assert_eq!(table.header, fields);
        assert_eq!(
            table.rows,
            vec![
                vec!["Q1".to_string(), "A1 more".to_string()],
                vec!["Q2".to_string(), String::new()],
            ]
        );

        let calls = store.calls.lock().unwrap();
        assert_eq!(calls[0].0, "findNotes");
        assert_eq!(calls[0].1["query"], r#"deck:"Bio" (tag:"a")"#);
        assert_eq!(calls[1].1["notes"], json!([11, 12, 13]));
    }

    #[tokio::test]
    async fn export_with_no_matches_is_header_only() {
        let store = ScriptedStore::new(vec![("findNotes", Ok(json!([])))]);
        let table = store
            .export_notes(&ExportQuery::new("Empty"), &["Front".to_string()])
            .await
            .unwrap();
        assert!(table.rows.is_empty());
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_bridge_is_reported() {
        // Port 9 (discard) is closed on test machines.
        let anki = AnkiConnect::with_url("http://127.0.0.1:9").unwrap();
        let err = anki.deck_names().await.unwrap_err();
        assert!(matches!(err, Pdf2AnkiError::NoteStoreUnavailable { .. }));
    }
}
