//! Stripping of inline images the model has already seen.
//!
//! A base64 image in a user message costs thousands of tokens on every
//! request. Once an assistant message follows it, the model has looked at the
//! image and the payload can be replaced by a short placeholder.

use crate::{Message, Role};
use regex::Regex;
use std::sync::LazyLock;

pub const IMAGE_PLACEHOLDER: &str = "[image: already viewed]";

static DATA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=\r\n]+")
        .expect("image data-uri regex should compile")
});

/// Whether `text` carries an inline base64 image.
pub fn has_inline_image(text: &str) -> bool {
    DATA_URI_RE.is_match(text)
}

/// Replace inline image payloads in user messages that an assistant message
/// follows. Returns how many messages changed.
pub fn strip_acknowledged_images(messages: &mut [Message]) -> usize {
    let Some(last_assistant) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return 0;
    };
    let mut stripped = 0;
    for m in messages[..last_assistant].iter_mut() {
        if m.role != Role::User || !has_inline_image(&m.content) {
            continue;
        }
        m.content = DATA_URI_RE
            .replace_all(&m.content, IMAGE_PLACEHOLDER)
            .into_owned();
        stripped += 1;
    }
    stripped
}
