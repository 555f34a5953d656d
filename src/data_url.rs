//! Converting binary data to a `data:` URL.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // Some sources say the Base64 data should also be percent-encoded, but in
    // practice that breaks Gemini and probably several other LLMs.
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_mime_type_and_payload() {
        assert_eq!(data_url("image/png", b"abc"), "data:image/png;base64,YWJj");
    }
}
