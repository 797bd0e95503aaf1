//! The permissible tag set for a tagging pass.
//!
//! Tagging prompts embed the taxonomy as `#Tag::Sub::Leaf` tokens inside
//! `{ ... }` blocks. The set is derived once from the prompt text when a
//! pass is configured and then used to drop any tag the model invents.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static BRACE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]*?)\}").expect("valid regex"));
static TAG_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[A-Za-z0-9_:\-]+").expect("valid regex"));

/// A set of allowed tags. An empty taxonomy allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Taxonomy {
    tags: BTreeSet<String>,
}

impl Taxonomy {
    /// No filtering.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Collect `#tag` tokens from the `{...}` blocks of `prompt`.
    ///
    /// Falls back to scanning the whole prompt when there are no blocks or
    /// the blocks hold no tags.
    pub fn from_prompt(prompt: &str) -> Self {
        let mut tags: BTreeSet<String> = BRACE_BLOCK
            .captures_iter(prompt)
            .filter_map(|c| c.get(1))
            .flat_map(|m| TAG_TOKEN.find_iter(m.as_str()))
            .map(|m| m.as_str().to_string())
            .collect();

        if tags.is_empty() {
            tags = TAG_TOKEN
                .find_iter(prompt)
                .map(|m| m.as_str().to_string())
                .collect();
        }
        Self { tags }
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// `true` if `tag` may be emitted. Always `true` for an empty taxonomy.
    pub fn allows(&self, tag: &str) -> bool {
        self.tags.is_empty() || self.tags.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_come_from_brace_blocks_only() {
        let prompt = "Use #NotATag in prose.\n\
                      Cardio: { #Card::HF #Card::Arrhythmia }\n\
                      Renal: { #Renal::AKI, #Renal::CKD-3 }";
        let tax = Taxonomy::from_prompt(prompt);
        let tags: Vec<&str> = tax.iter().collect();
        assert_eq!(
            tags,
            vec!["#Card::Arrhythmia", "#Card::HF", "#Renal::AKI", "#Renal::CKD-3"]
        );
        assert!(!tax.allows("#NotATag"));
    }

    #[test]
    fn falls_back_to_whole_prompt() {
        let tax = Taxonomy::from_prompt("Allowed: #A #B_c and {no tags here}");
        assert_eq!(tax.len(), 2);
        assert!(tax.allows("#A"));
        assert!(tax.allows("#B_c"));
    }

    #[test]
    fn empty_taxonomy_allows_anything() {
        let tax = Taxonomy::from_prompt("no tags at all");
        assert!(tax.is_empty());
        assert!(tax.allows("#Whatever"));
    }
}
