//! Defensive parsing and strict validation of generated content.
//!
//! Generation output is untrusted free text. It goes through three gates:
//! 1. `extract_json` pulls the JSON body out of prose or markdown fences
//! 2. `parse_output` deserializes it into the handler's draft type (PARSE_FAILED)
//! 3. the draft's `ContentContract` checks shape and rejects deferrals and
//!    filler (VALIDATION_FAILED / PLACEHOLDER_CONTENT)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::domain::{ErrorCode, JobError};

/// Strict content contract for a generated draft.
pub trait ContentContract {
    fn check(&self) -> Result<(), JobError>;
}

/// Extract the JSON body from a model response.
///
/// Looks for a ```json fence, then any ``` fence, then the outermost `{..}`
/// span, then the outermost `[..]` span. Falls back to the trimmed input.
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json")
        && let Some(end) = trimmed[start + 7..].find("```")
    {
        return trimmed[start + 7..start + 7 + end].trim();
    }
    if let Some(start) = trimmed.find("```") {
        let after_start = start + 3;
        // 言語指定（"json\n" など）を読み飛ばす
        let content_start = trimmed[after_start..]
            .find('\n')
            .map(|i| after_start + i + 1)
            .unwrap_or(after_start);
        if let Some(end) = trimmed[content_start..].find("```") {
            return trimmed[content_start..content_start + end].trim();
        }
    }

    if let Some(obj_start) = trimmed.find('{')
        && let Some(obj_end) = trimmed.rfind('}')
        && obj_end > obj_start
    {
        return &trimmed[obj_start..=obj_end];
    }
    if let Some(arr_start) = trimmed.find('[')
        && let Some(arr_end) = trimmed.rfind(']')
        && arr_end > arr_start
    {
        return &trimmed[arr_start..=arr_end];
    }

    trimmed
}

/// Extract and deserialize a draft. Any failure is PARSE_FAILED.
pub fn parse_output<T: DeserializeOwned>(response: &str) -> Result<T, JobError> {
    let body = extract_json(response);
    if body.is_empty() {
        return Err(JobError::new(ErrorCode::ParseFailed, "empty generation output"));
    }
    serde_json::from_str(body).map_err(|e| JobError::new(ErrorCode::ParseFailed, e.to_string()))
}

static PLACEHOLDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // deferrals: "will be discussed in a future class"
        r"(?i)\bwill be (covered|discussed|explained|explored|addressed|introduced|taught)\b.{0,40}\b(future|later|next|upcoming|subsequent|another)\b.{0,20}\b(class|lesson|session|lecture|chapter|module|unit)",
        r"(?i)\b(in|during) (a|the) (future|later|next|upcoming|subsequent) (class|lesson|session|lecture)",
        r"(?i)\bto be (determined|decided|added|announced|completed|written)\b",
        r"(?i)\b(coming soon|content goes here|lorem ipsum|placeholder (text|content|copy))\b",
        r"(?i)\[\s*placeholder\b[^\]]*\]",
        r"\b(TBD|TBA|TODO)\b",
        r"(?i)\[(insert|add|your)\b[^\]]*\]",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

/// First deferral / filler phrase found in `text`.
pub fn find_placeholder(text: &str) -> Option<&str> {
    PLACEHOLDER_PATTERNS
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str())
}

/// A required text field: no placeholders, not blank, at least `min_chars`.
pub fn require_text(field: &str, value: &str, min_chars: usize) -> Result<(), JobError> {
    if let Some(phrase) = find_placeholder(value) {
        return Err(JobError::new(
            ErrorCode::PlaceholderContent,
            format!("{field} contains placeholder text '{phrase}'"),
        ));
    }
    let len = value.trim().chars().count();
    if len < min_chars {
        return Err(JobError::new(
            ErrorCode::ValidationFailed,
            format!("{field} is too short ({len} < {min_chars} chars)"),
        ));
    }
    Ok(())
}

/// A list field with `min..=max` items.
pub fn require_count(field: &str, len: usize, min: usize, max: usize) -> Result<(), JobError> {
    if len < min || len > max {
        return Err(JobError::new(
            ErrorCode::ValidationFailed,
            format!("{field} must contain between {min} and {max} items, got {len}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Draft {
        title: String,
    }

    #[rstest]
    #[case::json_fence("Here you go:\n```json\n{\"title\": \"a\"}\n```\nThanks")]
    #[case::plain_fence("```\n{\"title\": \"a\"}\n```")]
    #[case::prose_wrapped("Sure! {\"title\": \"a\"} Hope that helps.")]
    #[case::bare("{\"title\": \"a\"}")]
    fn extracts_json_from_common_shapes(#[case] response: &str) {
        let draft: Draft = parse_output(response).unwrap();
        assert_eq!(draft.title, "a");
    }

    #[test]
    fn extracts_arrays_when_there_is_no_object() {
        assert_eq!(extract_json("list: [1, 2, 3]."), "[1, 2, 3]");
    }

    #[test]
    fn unparseable_output_is_parse_failed() {
        let err = parse_output::<Draft>("I cannot help with that.").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseFailed);
        let err = parse_output::<Draft>("   ").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseFailed);
    }

    #[rstest]
    #[case::future_class("Photosynthesis will be discussed in a future class.")]
    #[case::next_lesson("This will be covered in the next lesson.")]
    #[case::later_session("Details follow during a later session")]
    #[case::tbd("Key formula: TBD")]
    #[case::to_be_added("Examples to be added.")]
    #[case::insert("[Insert diagram of the cell here]")]
    #[case::lorem("Lorem ipsum dolor sit amet")]
    #[case::placeholder_text("Placeholder text for the summary")]
    #[case::bracketed_placeholder("[placeholder: worked example]")]
    fn placeholder_phrases_are_detected(#[case] text: &str) {
        assert!(find_placeholder(text).is_some(), "{text}");
        let err = require_text("body", text, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::PlaceholderContent);
    }

    #[rstest]
    #[case::substantive("Chlorophyll absorbs light energy and converts it into chemical energy.")]
    #[case::future_in_content("Students predict future population sizes from a growth model.")]
    #[case::class_in_content("Each class of enzyme catalyses a different reaction.")]
    #[case::placeholder_as_a_term("Format strings use {} as a placeholder for each argument.")]
    fn substantive_text_passes(#[case] text: &str) {
        assert_eq!(find_placeholder(text), None);
        assert!(require_text("body", text, 10).is_ok());
    }

    #[test]
    fn short_text_is_a_validation_failure() {
        let err = require_text("summary", " ok ", 10).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn count_bounds_are_inclusive() {
        assert!(require_count("chapters", 1, 1, 3).is_ok());
        assert!(require_count("chapters", 3, 1, 3).is_ok());
        assert_eq!(
            require_count("chapters", 0, 1, 3).unwrap_err().code,
            ErrorCode::ValidationFailed
        );
    }
}
