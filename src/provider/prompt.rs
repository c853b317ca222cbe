//! Prompt construction and response parsing shared by every provider.
//!
//! The user prompt carries the batch as a JSON array; the model must answer
//! with a JSON array of translated strings in the same order.

use crate::model::{TranslationBatch, TranslationResult};
use serde::Serialize;

/// Recorded in `sync_status.prompt_version`. Bump when the prompt changes
/// in a way that should be auditable.
pub const PROMPT_VERSION: &str = "2";

/// A `(system, user)` prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Serialize)]
struct PromptItem<'a> {
    key: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

/// Builds prompts for one project.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    source_locale: String,
    brand_names: Vec<String>,
}

impl PromptBuilder {
    pub fn new(source_locale: impl Into<String>, brand_names: Vec<String>) -> Self {
        Self {
            source_locale: source_locale.into(),
            brand_names,
        }
    }

    pub fn build(&self, batch: &TranslationBatch) -> Prompt {
        Prompt {
            system: self.system_prompt(&batch.lang_code),
            user: self.user_prompt(batch),
        }
    }

    fn system_prompt(&self, target: &str) -> String {
        let mut prompt = format!(
            r#"You are a professional software localizer. Translate user interface strings from locale "{}" to locale "{}".

## Rules
- Keep every placeholder exactly as written: {{name}}, {{{{count}}}}, ${{var}}, %s, %d, %i, %f, $1 and similar tokens must appear unchanged.
- Do not add placeholders that are not in the source.
- Preserve leading and trailing whitespace, punctuation style and line breaks.
- Keep the translation concise; UI space is limited.
- Use the optional "context" field only as a hint. Never translate it.
"#,
            self.source_locale, target
        );

        if !self.brand_names.is_empty() {
            prompt.push_str(&format!(
                "- Never translate these brand names: {}.\n",
                self.brand_names.join(", ")
            ));
        }

        prompt.push_str(
            "\n## Output\nReply with only a JSON array of strings: one translation per input item, in the same order. No commentary.",
        );
        prompt
    }

    fn user_prompt(&self, batch: &TranslationBatch) -> String {
        let items: Vec<PromptItem<'_>> = batch
            .units
            .iter()
            .map(|unit| PromptItem {
                key: &unit.key_path,
                text: &unit.source_text,
                context: unit.context.as_deref(),
            })
            .collect();

        // Plain string fields always serialize
        let payload = serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string());

        format!(
            "Translate these {} strings to \"{}\":\n\n{}",
            batch.units.len(),
            batch.lang_code,
            payload
        )
    }
}

/// Parse a model reply into exactly `expected` results.
///
/// Markdown code fences around the array are tolerated.
pub fn parse_translations(content: &str, expected: usize) -> Result<Vec<TranslationResult>, String> {
    let trimmed = strip_code_fence(content.trim());

    let values: Vec<String> = serde_json::from_str(trimmed)
        .map_err(|e| format!("reply is not a JSON array of strings: {}", e))?;

    if values.len() != expected {
        return Err(format!(
            "expected {} translations, got {}",
            expected,
            values.len()
        ));
    }

    Ok(values.into_iter().map(TranslationResult::new).collect())
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop an optional language tag on the opening fence line
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceUnit;
    use crate::planner::deduplication_key;

    fn batch(lang: &str, units: Vec<SourceUnit>) -> TranslationBatch {
        TranslationBatch {
            lang_code: lang.to_string(),
            reasons: Vec::new(),
            deduplication_key: deduplication_key(&units),
            units,
        }
    }

    // ==================== Prompt Tests ====================

    #[test]
    fn test_system_prompt_names_locales() {
        let builder = PromptBuilder::new("en", vec![]);
        let prompt = builder.build(&batch("fr", vec![]));
        assert!(prompt.system.contains(r#"from locale "en" to locale "fr""#));
        assert!(prompt.system.contains("{name}"));
        assert!(prompt.system.contains("{{count}}"));
        assert!(prompt.system.contains("${var}"));
        assert!(!prompt.system.contains("brand names"));
    }

    #[test]
    fn test_system_prompt_lists_brand_names() {
        let builder = PromptBuilder::new("en", vec!["Acme".to_string(), "Zed".to_string()]);
        let prompt = builder.build(&batch("de", vec![]));
        assert!(prompt.system.contains("Acme, Zed"));
    }

    #[test]
    fn test_user_prompt_contains_items_in_order() {
        let builder = PromptBuilder::new("en", vec![]);
        let units = vec![
            SourceUnit::new("a.title", "Hello", "en.json", 1).with_context("page header"),
            SourceUnit::new("a.body", "Say \"hi\"", "en.json", 1),
        ];
        let prompt = builder.build(&batch("es", units));

        let title = prompt.user.find("a.title").expect("first key");
        let body = prompt.user.find("a.body").expect("second key");
        assert!(title < body);
        assert!(prompt.user.contains("page header"));
        assert!(prompt.user.contains(r#"Say \"hi\""#), "Text should be JSON-escaped");
        assert!(prompt.user.contains("2 strings"));
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_plain_array() {
        let results = parse_translations(r#"["Bonjour", "Monde"]"#, 2).expect("parse");
        assert_eq!(results[0].translated_text, "Bonjour");
        assert_eq!(results[1].translated_text, "Monde");
        assert!(results[0].confidence.is_none());
    }

    #[test]
    fn test_parse_fenced_array() {
        let content = "```json\n[\"Hola\"]\n```";
        let results = parse_translations(content, 1).expect("parse");
        assert_eq!(results[0].translated_text, "Hola");
    }

    #[test]
    fn test_parse_count_mismatch() {
        let err = parse_translations(r#"["one"]"#, 2).expect_err("should fail");
        assert!(err.contains("expected 2"));
    }

    #[test]
    fn test_parse_not_json() {
        assert!(parse_translations("Sure! Here you go", 1).is_err());
    }
}
