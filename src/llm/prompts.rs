//! Prompt templates for OCR correction.

/// Default correction prompt.
///
/// Placeholders: `{document}` (document id), `{part}` ("part i of n"),
/// `{fields}` (field list, one per line) and `{text}` (the OCR text).
pub const DEFAULT_CORRECTION_PROMPT: &str = r#"You are an expert OCR correction assistant. Your task is to fix OCR errors in the following text while preserving ALL original information and meaning.

IMPORTANT RULES:
1. Fix obvious OCR mistakes (like "€" → "E", "0" → "O", etc.)
2. Correct spacing and formatting issues
3. Fix broken words and sentences
4. Preserve ALL original content - do not add or remove any information
5. Maintain the original document structure and formatting
6. Keep all numbers, dates, names, and technical terms exactly as they should be
7. If you're unsure about a correction, keep the original text

Also extract these fields from the text, leaving out any that do not appear:
{fields}

Document: {document} ({part})

Respond with ONLY a JSON object of this shape, no commentary:
{"corrected_text": "<the corrected text>", "fields": {"<field>": <string or list of strings>}}

OCR Text to correct:
{text}
"#;

/// Fill the correction template.
pub fn render_correction_prompt(
    template: &str,
    document_id: &str,
    chunk_index: usize,
    chunk_count: usize,
    fields: &[String],
    text: &str,
) -> String {
    let field_list = fields
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    // {text} last so OCR text containing a placeholder is left alone
    template
        .replace("{document}", document_id)
        .replace("{part}", &format!("part {} of {}", chunk_index + 1, chunk_count))
        .replace("{fields}", &field_list)
        .replace("{text}", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_every_placeholder() {
        let prompt = render_correction_prompt(
            DEFAULT_CORRECTION_PROMPT,
            "CIA-RDP80",
            1,
            3,
            &["title".to_string(), "keywords".to_string()],
            "TEXT WITH {document} INSIDE",
        );
        assert!(prompt.contains("Document: CIA-RDP80 (part 2 of 3)"));
        assert!(prompt.contains("- title\n- keywords"));
        assert!(prompt.contains("TEXT WITH {document} INSIDE"));
        assert!(prompt.contains("Preserve ALL original content"));
    }
}
