//! Default prompts for extraction and tagging.
//!
//! Every prompt can be replaced through [`crate::config::WorkflowConfigBuilder`]
//! (or `--*-prompt-file` on the command line); these constants are used only
//! when no override is given.
//!
//! The tagging prompts double as taxonomy definitions: every `#Tag::Path`
//! token inside a `{ ... }` block is a legal tag for that pass (see
//! [`crate::pipeline::taxonomy::Taxonomy::from_prompt`]).

/// Whole-document extraction from a slide deck (PDF upload).
pub const VISUAL_EXTRACTION_PROMPT: &str = r#"You extract question/answer pairs from a quiz slide deck supplied as a PDF.

Decks come in two layouts:
- Consecutive: the answer slide directly follows its question slide.
- Buffered: one or more filler slides sit between a question and its answer. Filler slides carry no question or answer content.

Answer with ONE JSON array and nothing else. Each element is an object with exactly these keys:

{
  "question_page": <number>,                  // page where the question text starts
  "question_text": "<string>",                // full question text on one line, numbering removed
  "relevant_question_image_pages": [<number>], // pages whose images are needed to ask the question
  "answer_page": <number>,                    // page where the answer starts, after any filler slides
  "answer_text": "<string>",                  // full answer text on one line, numbering removed
  "relevant_answer_image_pages": [<number>]    // pages whose images show or explain the answer
}

Rules:
1. Page numbers are 1-based.
2. A page that shows answer text belongs to the answer side. Never list it under relevant_question_image_pages.
3. Never list filler slides in any page array.
4. Use [] when a side has no relevant images.
5. Skip any pair you cannot identify with confidence.
6. No markdown fences, no commentary: the first character is [ and the last is ].
"#;

/// Chunked extraction from plain text (text PDFs and `.txt` files).
pub const TEXT_EXTRACTION_PROMPT: &str = r#"You extract question/answer pairs that already exist in a piece of text, such as a quiz book or study guide. You will receive the text in chunks; treat every chunk on its own.

Answer with ONE JSON array and nothing else. Each element is an object with exactly these keys:

{
  "source_page_approx": <number>,  // page marker near the pair ("Page 12:" and similar), or 0 when there is none
  "question": "<string>",         // the question exactly as written, on one line
  "answer": "<string>"            // the answer exactly as written, on one line
}

Rules:
1. Copy wording verbatim. Fix only unmistakable typos; never paraphrase or summarise.
2. Join lines inside a question or answer with single spaces and trim the ends.
3. Drop structural prefixes such as "Q7." or "A:" when the document uses them consistently.
4. Skip a pair whose question and answer cannot be told apart reliably.
5. If the chunk holds no pairs, answer [].
6. No markdown fences, no commentary: the first character is [ and the last is ].
"#;

/// First tagging pass: format, difficulty, place and period.
pub const TAGGING_PASS_ONE_PROMPT: &str = r#"You classify quiz items. Each input line looks like

[n] question | media | answer | media

and you answer with one line per input line, in the same order:

[n] tag tag tag

Use ONLY tags copied exactly from the braces below. Pick every tag that applies, at least one per group when possible. Output nothing except the numbered lines.

Input type
{
#Core::InputType::Is-A-Question
#Core::InputType::Is-An-Idea-For-Future-Question
#Core::InputType::Important-Knowledge
#Core::InputType::Something-To-Remember
}

Question format
{
#Core::QFormat::Single-Part-Straightforward-Question
#Core::QFormat::Two-Part-Straightforward-Question
#Core::QFormat::Multi-Part-Question
#Core::QFormat::Connect-The-Clues
#Core::QFormat::Identify-From-Visual
#Core::QFormat::Fill-In-The-Blank
}

Difficulty
{
#Core::QLevel::School-Or-Common-Knowledge-Level
#Core::QLevel::College-Or-Common-Trivia-Level
#Core::QLevel::Open-Quizzing-Or-Niche-Knowledge-Level
}

Where
{
#Core::Where::India
#Core::Where::Asia
#Core::Where::Europe
#Core::Where::Africa
#Core::Where::North-America
#Core::Where::South-America
#Core::Where::Oceania
#Core::Where::Global
#Core::Where::Space
}

When
{
#Core::When::Ancient
#Core::When::Medieval
#Core::When::Early-Modern
#Core::When::19th-Century
#Core::When::20th-Century
#Core::When::21st-Century
#Core::When::Timeless
}
"#;

/// Optional second tagging pass: subject and modifiers.
pub const TAGGING_PASS_TWO_PROMPT: &str = r#"You classify quiz items. Each input line looks like

[n] question | media | answer | media | Initial Tags: tags from an earlier pass

and you answer with one line per input line, in the same order:

[n] tag tag tag

Use ONLY tags copied exactly from the braces below; do not repeat the initial tags. Pick every tag that applies and at least one subject. Output nothing except the numbered lines.

Subject
{
#Subject::History
#Subject::Geography
#Subject::Science::Physics
#Subject::Science::Chemistry
#Subject::Science::Biology
#Subject::Science::Medicine
#Subject::Technology
#Subject::Mathematics
#Subject::Literature
#Subject::Language-And-Etymology
#Subject::Arts::Visual-Arts
#Subject::Arts::Music
#Subject::Arts::Film-And-Television
#Subject::Sports-And-Games
#Subject::Politics-And-Law
#Subject::Religion-And-Mythology
#Subject::Food-And-Drink
#Subject::Finance
#Subject::Business
#Subject::Marketing::Branding
#Subject::Industry
}

Related to
{
#Modifiers::Related-To::Person
#Modifiers::Related-To::Any-Organization
#Modifiers::Related-To::Place
#Modifiers::Related-To::Event
#Modifiers::Related-To::Idea
#Modifiers::Related-To::Invention-Or-Discovery
#Modifiers::Related-To::Work-Of-Art-Or-Literature
#Modifiers::Related-To::Word-Or-Name-Origin
}

Worth asking because
{
#Modifiers::Worth-Asking-Because::Is-Unique-Rare-Or-Exceptional
#Modifiers::Worth-Asking-Because::Has-A-Surprising-Connection
#Modifiers::Worth-Asking-Because::Is-A-First-Or-Record
#Modifiers::Worth-Asking-Because::Is-Topical
#Modifiers::Worth-Asking-Because::Is-Foundational-Knowledge
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::taxonomy::Taxonomy;

    #[test]
    fn extraction_prompts_name_every_required_key() {
        for key in [
            "question_page",
            "question_text",
            "relevant_question_image_pages",
            "answer_page",
            "answer_text",
            "relevant_answer_image_pages",
        ] {
            assert!(VISUAL_EXTRACTION_PROMPT.contains(key), "missing {key}");
        }
        assert!(TEXT_EXTRACTION_PROMPT.contains("\"question\""));
        assert!(TEXT_EXTRACTION_PROMPT.contains("\"answer\""));
    }

    #[test]
    fn tagging_prompts_define_disjoint_taxonomies() {
        let one = Taxonomy::from_prompt(TAGGING_PASS_ONE_PROMPT);
        let two = Taxonomy::from_prompt(TAGGING_PASS_TWO_PROMPT);
        assert!(one.allows("#Core::QLevel::College-Or-Common-Trivia-Level"));
        assert!(two.allows("#Subject::History"));
        assert!(one.len() > 20);
        assert!(two.len() > 20);
        assert!(one.iter().all(|t| !two.allows(t)));
    }
}
