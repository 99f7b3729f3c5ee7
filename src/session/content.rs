use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::discussion::MessageKind;
use crate::error::SessionError;

const MAX_TEXT_CHARS: usize = 4000;
const MAX_STICKER_CHARS: usize = 64;
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024; // 5MB

/// Checks a chat payload for its kind and returns the content to store.
pub fn validate(kind: MessageKind, content: &str) -> Result<String, SessionError> {
    match kind {
        MessageKind::Text => {
            let text = content.trim();
            if text.is_empty() {
                return Err(SessionError::validation("message must not be empty"));
            }
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(SessionError::validation(format!(
                    "message exceeds {MAX_TEXT_CHARS} characters"
                )));
            }
            Ok(text.to_string())
        }
        MessageKind::Sticker => {
            let code = content.trim();
            if code.is_empty() || code.chars().count() > MAX_STICKER_CHARS {
                return Err(SessionError::validation("invalid sticker code"));
            }
            Ok(code.to_string())
        }
        MessageKind::Image => validate_image(content).map(|()| content.to_string()),
        MessageKind::System => Err(SessionError::validation(
            "system messages are posted by the session, not by participants",
        )),
    }
}

fn validate_image(content: &str) -> Result<(), SessionError> {
    let Some(rest) = content.strip_prefix("data:image/") else {
        return Err(SessionError::validation("image must be a data:image URL"));
    };
    let Some((_, payload)) = rest.split_once(";base64,") else {
        return Err(SessionError::validation("image must be base64 encoded"));
    };
    // Cheap upper bound before decoding.
    if payload.len() / 4 * 3 > MAX_IMAGE_BYTES + 3 {
        return Err(SessionError::validation("image exceeds the maximum size"));
    }
    let bytes = BASE64
        .decode(payload)
        .map_err(|_| SessionError::validation("invalid image data"))?;
    if bytes.is_empty() {
        return Err(SessionError::validation("image is empty"));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(SessionError::validation("image exceeds the maximum size"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_trimmed() {
        assert_eq!(validate(MessageKind::Text, "  hello ").unwrap(), "hello");
        assert!(validate(MessageKind::Text, "   ").is_err());
    }

    #[test]
    fn long_text_is_rejected() {
        let text = "a".repeat(MAX_TEXT_CHARS + 1);
        assert!(matches!(
            validate(MessageKind::Text, &text),
            Err(SessionError::Validation(_))
        ));
    }

    #[test]
    fn images_must_be_base64_data_urls() {
        let png = format!("data:image/png;base64,{}", BASE64.encode([0x89, b'P', b'N', b'G']));
        assert_eq!(validate(MessageKind::Image, &png).unwrap(), png);
        assert!(validate(MessageKind::Image, "https://example.com/cat.png").is_err());
        assert!(validate(MessageKind::Image, "data:image/png;base64,!!!").is_err());
        assert!(validate(MessageKind::Image, "data:image/png,raw").is_err());
    }

    #[test]
    fn participants_cannot_send_system_messages() {
        assert!(validate(MessageKind::System, "the teacher left").is_err());
    }
}
