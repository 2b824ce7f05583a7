//! HTML escaping for record fields that reach downstream viewers.
//!
//! Escaping happens after validation and must be idempotent: records can be
//! re-validated (and re-escaped) on replay without growing `&amp;amp;` chains.

/// Entities the escaper emits. An ampersand that already introduces one of
/// these is left untouched, which is what makes [`escape_html`] idempotent.
pub(crate) const EMITTED_ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&#x27;"];

/// Escape the HTML-significant characters in `input`.
///
/// Returns the input unchanged (no allocation) when nothing needs escaping.
pub fn escape_html(input: &str) -> String {
    if !input
        .bytes()
        .any(|b| matches!(b, b'&' | b'<' | b'>' | b'"' | b'\''))
    {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len() + 8);
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < input.len() {
        match bytes[i] {
            b'&' => {
                let rest = &input[i..];
                if let Some(entity) = EMITTED_ENTITIES.iter().find(|e| rest.starts_with(**e)) {
                    out.push_str(entity);
                    i += entity.len();
                    continue;
                }
                out.push_str("&amp;");
                i += 1;
            }
            b'<' => {
                out.push_str("&lt;");
                i += 1;
            }
            b'>' => {
                out.push_str("&gt;");
                i += 1;
            }
            b'"' => {
                out.push_str("&quot;");
                i += 1;
            }
            b'\'' => {
                out.push_str("&#x27;");
                i += 1;
            }
            _ => {
                // Copy the whole UTF-8 scalar, not just one byte.
                let ch = input[i..].chars().next().expect("in-bounds char");
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    out
}
