//! Fenced code block extraction from assistant answers.
//!
//! Only the first triple-backtick fence in an answer is extracted; later
//! fences stay in the display text verbatim.

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// The answer text with the whole fenced region removed.
    pub remainder: String,
    /// Inner source of the fence, outer whitespace trimmed.
    pub code: String,
}

/// Find the first fenced code region in `text`.
///
/// The opening marker may carry a language tag on the same line; the tag is
/// not part of the extracted code. An unclosed fence extends to the end of
/// the text. Returns `None` when no fence exists, in which case the caller
/// must not treat the answer as containing code.
pub fn extract_first_fence(text: &str) -> Option<Extracted> {
    let open = text.find("```")?;
    let after_marker = open + 3;

    let close = text[after_marker..].find("```").map(|idx| after_marker + idx);
    let body_end = close.unwrap_or(text.len());
    let region_end = close.map(|idx| idx + 3).unwrap_or(text.len());

    let body = &text[after_marker..body_end];
    // Everything on the opening line after the marker is the language tag.
    // A fence that opens and closes on one line has no tag, only code.
    let code = match body.find('\n') {
        Some(newline) => &body[newline + 1..],
        None => body,
    };

    let mut remainder = String::with_capacity(text.len() - (region_end - open));
    remainder.push_str(&text[..open]);
    remainder.push_str(&text[region_end..]);

    Some(Extracted {
        remainder,
        code: code.trim().to_string(),
    })
}
