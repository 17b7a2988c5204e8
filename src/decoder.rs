//! Body and attachment payload decoding shared by every provider.
//!
//! Providers disagree on which base64 alphabet and padding they emit, so every
//! decode walks the same ordered list of engines. Nothing here fails loudly: a
//! body that cannot be decoded comes back as the raw input string.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

const HTML_WRAP_WIDTH: usize = 120;

/// A node of a MIME part tree as exposed by a provider payload.
pub trait BodyPart {
    fn mime_type(&self) -> Option<&str>;
    fn body_data(&self) -> Option<&str>;
    fn children(&self) -> &[Self]
    where
        Self: Sized;
}

fn engines() -> [&'static base64::engine::GeneralPurpose; 3] {
    [&URL_SAFE_NO_PAD, &STANDARD, &URL_SAFE]
}

fn compact(data: &str) -> String {
    data.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

/// Decodes a text body, falling back to the input when no engine accepts it.
///
/// Earlier engines must yield valid UTF-8; the last one is converted lossily.
pub fn decode_body(data: &str) -> String {
    let compacted = compact(data);
    let [first, second, last] = engines();
    for engine in [first, second] {
        if let Ok(bytes) = engine.decode(&compacted) {
            if let Ok(text) = String::from_utf8(bytes) {
                return text;
            }
        }
    }
    match last.decode(&compacted) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => data.to_string(),
    }
}

/// Decodes a binary attachment payload with the same engine order as [`decode_body`].
pub fn decode_bytes(data: &str) -> Option<Vec<u8>> {
    let compacted = compact(data);
    engines()
        .into_iter()
        .find_map(|engine| engine.decode(&compacted).ok())
}

/// Depth-first search for the first non-empty text leaf.
pub fn walk_parts<P: BodyPart>(parts: &[P]) -> String {
    for part in parts {
        if let Some(text) = leaf_text(part) {
            return text;
        }
        let nested = walk_parts(part.children());
        if !nested.is_empty() {
            return nested;
        }
    }
    String::new()
}

fn leaf_text<P: BodyPart>(part: &P) -> Option<String> {
    let mime_type = part.mime_type()?.trim().to_ascii_lowercase();
    let data = part.body_data().filter(|data| !data.trim().is_empty())?;

    let text = match mime_type.as_str() {
        "text/plain" => decode_body(data),
        "text/html" => strip_html(&decode_body(data)),
        _ => return None,
    };

    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Renders HTML as plain text; a renderer panic yields an empty string.
pub fn strip_html(html: &str) -> String {
    std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_default()
}
