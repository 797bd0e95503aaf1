//! Records produced by the extraction stage.
//!
//! The model is asked for strict shapes but answers in free JSON, so page
//! references are kept in whatever form the model used and only normalised
//! (via [`PageRef::canonical`]) at the moment they are looked up.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A page number as the model wrote it: `2`, `2.0`, `"2"`, or something
/// unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Int(i64),
    Float(f64),
    Text(String),
    Other(Value),
}

impl PageRef {
    /// Canonical decimal form used as a [`PageImageMap`] key, or `None` if
    /// the value is not an integral page number.
    pub fn canonical(&self) -> Option<String> {
        match self {
            PageRef::Int(n) => Some(n.to_string()),
            PageRef::Float(f) => integral(*f).map(|n| n.to_string()),
            PageRef::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
                    .map(|n| n.to_string())
            }
            PageRef::Other(_) => None,
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0).then_some(f as i64)
}

impl From<i64> for PageRef {
    fn from(n: i64) -> Self {
        PageRef::Int(n)
    }
}

/// The `relevant_*_image_pages` field: normally a list of pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageList {
    List(Vec<PageRef>),
    Other(Value),
}

impl Default for PageList {
    fn default() -> Self {
        PageList::List(Vec::new())
    }
}

impl PageList {
    /// The listed pages; empty when the field was not a list.
    pub fn pages(&self) -> &[PageRef] {
        match self {
            PageList::List(pages) => pages,
            PageList::Other(_) => &[],
        }
    }
}

impl<T: Into<PageRef>> FromIterator<T> for PageList {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        PageList::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Page number (canonical decimal string) → image filename, for one PDF.
///
/// Built once during page-image generation and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageImageMap(BTreeMap<String, String>);

impl PageImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map 1-based `page` to `filename`.
    pub fn insert(&mut self, page: usize, filename: impl Into<String>) {
        self.0.insert(page.to_string(), filename.into());
    }

    /// Look up a page reference after canonicalising it.
    pub fn lookup(&self, page: &PageRef) -> Option<&str> {
        let key = page.canonical()?;
        self.0.get(&key).map(String::as_str)
    }

    pub fn get(&self, page: usize) -> Option<&str> {
        self.0.get(&page.to_string()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<S: Into<String>> FromIterator<(usize, S)> for PageImageMap {
    fn from_iter<I: IntoIterator<Item = (usize, S)>>(iter: I) -> Self {
        let mut map = PageImageMap::new();
        for (page, name) in iter {
            map.insert(page, name);
        }
        map
    }
}

/// One question/answer pair extracted from a slide deck.
///
/// All six model-facing fields are required; the two underscore fields are
/// attached afterwards and only ever read by the TSV assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualRecord {
    pub question_page: PageRef,
    pub question_text: String,
    pub relevant_question_image_pages: PageList,
    pub answer_page: PageRef,
    pub answer_text: String,
    pub relevant_answer_image_pages: PageList,

    #[serde(
        rename = "_page_image_map",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub page_image_map: Option<PageImageMap>,

    #[serde(
        rename = "_source_pdf_prefix",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_pdf_prefix: Option<String>,
}

impl VisualRecord {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// One question/answer pair extracted from a text chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRecord {
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page_approx: Option<i64>,
}

impl TextRecord {
    /// Accept any object carrying both `question` and `answer`.
    ///
    /// Non-string values are kept in their JSON text form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let question = value_text(obj.get("question")?);
        let answer = value_text(obj.get("answer")?);
        let source_page_approx = obj.get("source_page_approx").and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Some(Self {
            question,
            answer,
            source_page_approx,
        })
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
