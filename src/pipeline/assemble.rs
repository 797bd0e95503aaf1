//! TSV assembly: extracted records → Anki import rows.
//!
//! Output is plain tab-separated text with `\n` line endings and no quoting.
//! Every field goes through [`clean_field`] first, so no field can contain a
//! tab or a line break and the file stays rectangular.
//!
//! Media columns hold `<img src="...">` tags resolved through the record's
//! [`PageImageMap`]. The tags are deduplicated and sorted as strings, so
//! the order is lexicographic by filename rather than by page number.

use crate::error::Pdf2AnkiError;
use crate::pipeline::tag::TagTable;
use crate::record::{PageImageMap, PageList, PageRef, TextRecord, VisualRecord};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Column header of the visual (slide deck) table.
pub const VISUAL_HEADER: [&str; 5] = ["Question", "QuestionMedia", "Answer", "AnswerMedia", "Tags"];
/// Column header of the text-analysis table.
pub const TEXT_HEADER: [&str; 3] = ["Question", "Answer", "Tags"];

/// Make free text safe for a single TSV field: line breaks become `<br>`,
/// tabs become spaces.
pub fn clean_field(text: &str) -> String {
    text.replace("\r\n", "<br>")
        .replace(['\n', '\r'], "<br>")
        .replace('\t', " ")
}

/// Escape a value for use inside a double-quoted HTML attribute.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Logs each distinct problem once per assembly run.
#[derive(Default)]
struct WarnOnce(HashSet<String>);

impl WarnOnce {
    fn warn(&mut self, cause: String) {
        if self.0.insert(cause.clone()) {
            warn!("{}", cause);
        }
    }
}

/// Which pages feed the media columns.
///
/// The default leaves the primary question/answer pages out, so a slide
/// with no relevant pages gets an empty media cell; set
/// `include_primary_pages` to attach them as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaOptions {
    /// Also attach the image of `question_page` / `answer_page` themselves,
    /// not only the `relevant_*_image_pages`.
    pub include_primary_pages: bool,
}

fn media_column(
    primary: Option<&PageRef>,
    relevant: &[PageRef],
    map: Option<&PageImageMap>,
    source: &str,
    warnings: &mut WarnOnce,
) -> String {
    let pages: Vec<&PageRef> = primary.into_iter().chain(relevant.iter()).collect();
    if pages.is_empty() {
        return String::new();
    }
    let Some(map) = map else {
        warnings.warn(format!("no page-image map for records from '{source}'; media left empty"));
        return String::new();
    };

    let mut tags = BTreeSet::new();
    for page in pages {
        let Some(key) = page.canonical() else {
            warnings.warn(format!("unusable page number {page:?} in records from '{source}'"));
            continue;
        };
        match map.lookup(page) {
            Some(file) => {
                tags.insert(format!("<img src=\"{}\">", escape_attr(file)));
            }
            None => warnings.warn(format!("no image for page {key} of '{source}'")),
        }
    }
    tags.into_iter().collect::<Vec<_>>().join(" ")
}

/// Build the 5-column visual table. `Tags` starts empty.
pub fn visual_table(records: &[VisualRecord]) -> TagTable {
    visual_table_with(records, MediaOptions::default())
}

/// [`visual_table`] with explicit media options.
pub fn visual_table_with(records: &[VisualRecord], options: MediaOptions) -> TagTable {
    let mut warnings = WarnOnce::default();
    let rows = records
        .iter()
        .map(|rec| {
            let source = rec.source_pdf_prefix.as_deref().unwrap_or("unknown source");
            let map = rec.page_image_map.as_ref();
            for (field, list) in [
                ("relevant_question_image_pages", &rec.relevant_question_image_pages),
                ("relevant_answer_image_pages", &rec.relevant_answer_image_pages),
            ] {
                if let PageList::Other(v) = list {
                    warnings.warn(format!("'{field}' is not a list in '{source}': {v}"));
                }
            }
            let q_primary = options.include_primary_pages.then_some(&rec.question_page);
            let a_primary = options.include_primary_pages.then_some(&rec.answer_page);
            vec![
                clean_field(&rec.question_text),
                media_column(
                    q_primary,
                    rec.relevant_question_image_pages.pages(),
                    map,
                    source,
                    &mut warnings,
                ),
                clean_field(&rec.answer_text),
                media_column(
                    a_primary,
                    rec.relevant_answer_image_pages.pages(),
                    map,
                    source,
                    &mut warnings,
                ),
                String::new(),
            ]
        })
        .collect();

    TagTable::new(VISUAL_HEADER.iter().map(|s| s.to_string()).collect(), rows)
}

/// Build the 3-column text-analysis table. `Tags` starts empty.
pub fn text_table(records: &[TextRecord]) -> TagTable {
    let rows = records
        .iter()
        .map(|rec| {
            vec![
                clean_field(&rec.question),
                clean_field(&rec.answer),
                String::new(),
            ]
        })
        .collect();
    TagTable::new(TEXT_HEADER.iter().map(|s| s.to_string()).collect(), rows)
}

/// One cleaned TSV line, newline included.
pub fn render_row(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| clean_field(f))
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}

/// Render a header and rows as TSV text.
pub fn render_tsv(header: &[String], rows: &[Vec<String>]) -> String {
    std::iter::once(header)
        .chain(rows.iter().map(Vec::as_slice))
        .map(render_row)
        .collect()
}

/// Write `table` to `path` (temp file, then rename).
pub async fn write_tsv(path: &Path, table: &TagTable) -> Result<(), Pdf2AnkiError> {
    write_atomic(path, render_tsv(&table.header, &table.rows)).await?;
    info!("Wrote {} rows to {}", table.rows.len(), path.display());
    Ok(())
}

/// Read a TSV with a header line. Blank lines are ignored.
pub async fn read_tsv(path: &Path) -> Result<TagTable, Pdf2AnkiError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Pdf2AnkiError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => Pdf2AnkiError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    let table = parse_tsv(&text).ok_or_else(|| {
        Pdf2AnkiError::EmptyInput(format!("'{}' has no header line", path.display()))
    })?;
    debug!(
        "Read {} rows x {} columns from {}",
        table.rows.len(),
        table.header.len(),
        path.display()
    );
    Ok(table)
}

/// Parse TSV text; `None` when there is no header.
pub fn parse_tsv(text: &str) -> Option<TagTable> {
    let mut lines = text
        .lines()
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines.next()?.split('\t').map(str::to_string).collect();
    let rows = lines
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect();
    Some(TagTable::new(header, rows))
}

/// `path` with `.tmp` appended to the file name.
pub(crate) fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    path.with_file_name(tmp_name)
}

/// Write `body` to a sibling temp file and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, body: String) -> Result<(), Pdf2AnkiError> {
    let write_err = |e| Pdf2AnkiError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = tmp_sibling(path);
    tokio::fs::write(&tmp_path, body).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(q_rel: &[i64], a_rel: &[i64], map: Option<PageImageMap>) -> VisualRecord {
        VisualRecord {
            question_page: 1.into(),
            question_text: "Q\nX".into(),
            relevant_question_image_pages: q_rel.iter().copied().collect(),
            answer_page: 2.into(),
            answer_text: "A\tB".into(),
            relevant_answer_image_pages: a_rel.iter().copied().collect(),
            page_image_map: map,
            source_pdf_prefix: Some("deck".into()),
        }
    }

    fn ab_map() -> PageImageMap {
        [(1, "a.jpg"), (2, "b.jpg")].into_iter().collect()
    }

    #[test]
    fn media_tags_sorted_lexicographically() {
        let table = visual_table(&[record(&[2, 1], &[], Some(ab_map()))]);
        assert_eq!(table.rows[0][1], r#"<img src="a.jpg"> <img src="b.jpg">"#);
    }

    #[test]
    fn tags_sort_as_strings_not_pages() {
        let map: PageImageMap = [(2, "p10.jpg"), (10, "p2.jpg")].into_iter().collect();
        let table = visual_table(&[record(&[2, 10], &[], Some(map))]);
        assert_eq!(table.rows[0][1], r#"<img src="p10.jpg"> <img src="p2.jpg">"#);
    }

    #[test]
    fn duplicates_collapse() {
        let table = visual_table(&[record(&[1, 1], &[], Some(ab_map()))]);
        assert_eq!(table.rows[0][1], r#"<img src="a.jpg">"#);
    }

    #[test]
    fn missing_page_contributes_nothing() {
        let table = visual_table(&[record(&[1, 7], &[9], Some(ab_map()))]);
        assert_eq!(table.rows[0][1], r#"<img src="a.jpg">"#);
        assert_eq!(table.rows[0][3], "");
    }

    #[test]
    fn missing_map_and_bad_pages_are_not_fatal() {
        let mut rec = record(&[1], &[2], None);
        let table = visual_table(&[rec.clone()]);
        assert_eq!(table.rows[0][1], "");
        assert_eq!(table.rows[0][3], "");

        rec.page_image_map = Some(ab_map());
        rec.relevant_question_image_pages =
            PageList::List(vec![PageRef::Text("page one".into()), PageRef::Float(2.0)]);
        rec.relevant_answer_image_pages = PageList::Other(serde_json::json!("2"));
        let table = visual_table(&[rec]);
        assert_eq!(table.rows[0][1], r#"<img src="b.jpg">"#);
        assert_eq!(table.rows[0][3], "");
    }

    #[test]
    fn text_is_cleaned_and_row_matches_header() {
        let table = visual_table(&[record(&[], &[2], Some(ab_map()))]);
        assert_eq!(table.header, VISUAL_HEADER.map(String::from).to_vec());
        assert_eq!(
            table.rows[0],
            vec![
                "Q<br>X".to_string(),
                String::new(),
                "A B".to_string(),
                r#"<img src="b.jpg">"#.to_string(),
                String::new(),
            ]
        );
    }

    #[test]
    fn primary_pages_are_opt_in() {
        let recs = [record(&[], &[], Some(ab_map()))];
        let table = visual_table_with(&recs, MediaOptions::default());
        assert_eq!(table.rows[0][1], "");
        assert_eq!(table.rows[0][3], "");

        let opts = MediaOptions {
            include_primary_pages: true,
        };
        let table = visual_table_with(&recs, opts);
        assert_eq!(table.rows[0][1], r#"<img src="a.jpg">"#);
        assert_eq!(table.rows[0][3], r#"<img src="b.jpg">"#);
    }

    #[test]
    fn filenames_are_attribute_escaped() {
        let map: PageImageMap = [(1, r#"a"b&c.jpg"#)].into_iter().collect();
        let table = visual_table(&[record(&[1], &[], Some(map))]);
        assert_eq!(table.rows[0][1], r#"<img src="a&quot;b&amp;c.jpg">"#);
    }

    #[test]
    fn crlf_and_cr_become_br() {
        assert_eq!(clean_field("a\r\nb\rc\nd"), "a<br>b<br>c<br>d");
    }

    #[test]
    fn text_table_has_three_columns() {
        let table = text_table(&[TextRecord {
            question: "Why\n?".into(),
            answer: "Because".into(),
            source_page_approx: Some(4),
        }]);
        assert_eq!(table.header, vec!["Question", "Answer", "Tags"]);
        assert_eq!(table.rows[0], vec!["Why<br>?", "Because", ""]);
    }

    #[tokio::test]
    async fn write_then_read_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("deck.txt");
        let table = visual_table(&[record(&[1], &[2], Some(ab_map()))]);
        write_tsv(&path, &table).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("Question\tQuestionMedia\tAnswer\tAnswerMedia\tTags\n"));
        assert_eq!(raw.lines().count(), 2);

        let back = read_tsv(&path).await.unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn parse_tsv_skips_blank_lines() {
        let table = parse_tsv("H1\tH2\r\n\r\na\tb\n\n").unwrap();
        assert_eq!(table.header, vec!["H1", "H2"]);
        assert_eq!(table.rows, vec![vec!["a".to_string(), "b".to_string()]]);
        assert!(parse_tsv("\n \n").is_none());
    }
}
