use chat_proto::{Attachment, Message};

/// Maximum number of characters of text content kept in a preview.
pub const PREVIEW_CHARS: usize = 100;

pub const DELETED_LABEL: &str = "Message deleted";
pub const PHOTO_LABEL: &str = "Photo";
pub const VOICE_LABEL: &str = "Voice message";
pub const FILE_LABEL: &str = "File";

/// Conversation-list preview for a message.
pub fn preview(message: &Message) -> String {
    if message.is_deleted {
        return DELETED_LABEL.into();
    }
    if let Some(text) = message.content.as_deref().map(str::trim) {
        if !text.is_empty() {
            return truncate(text, PREVIEW_CHARS);
        }
    }
    attachment_label(&message.attachments).unwrap_or_default()
}

/// Label for attachment-only messages: image, then audio, then the file name.
pub fn attachment_label(attachments: &[Attachment]) -> Option<String> {
    if attachments.is_empty() {
        return None;
    }
    if attachments.iter().any(|a| top_level_type(a) == "image") {
        return Some(PHOTO_LABEL.into());
    }
    if attachments.iter().any(|a| top_level_type(a) == "audio") {
        return Some(VOICE_LABEL.into());
    }
    let name = attachments[0].file_name.trim();
    Some(if name.is_empty() {
        FILE_LABEL.into()
    } else {
        name.to_string()
    })
}

fn top_level_type(a: &Attachment) -> String {
    match a.mime_type.as_deref() {
        Some(m) if !m.is_empty() => m.split('/').next().unwrap_or_default().to_ascii_lowercase(),
        _ => mime_guess::from_path(&a.file_name)
            .first()
            .map(|m| m.type_().as_str().to_string())
            .unwrap_or_default(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn attachment(name: &str, mime: Option<&str>) -> Attachment {
        Attachment {
            id: Uuid::new_v4(),
            file_name: name.into(),
            mime_type: mime.map(Into::into),
            size_bytes: 10,
            url: format!("https://files.example/{name}"),
            thumbnail_url: None,
            width: None,
            height: None,
        }
    }

    fn message(content: Option<&str>, attachments: Vec<Attachment>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            content: content.map(Into::into),
            message_type: Default::default(),
            reply_to_id: None,
            forwarded_from_id: None,
            reactions: Default::default(),
            is_edited: false,
            is_deleted: false,
            delivered_to: Default::default(),
            read_by: Default::default(),
            attachments,
            created_at: 0,
            edited_at: None,
        }
    }

    #[test]
    fn text_is_used_verbatim() {
        assert_eq!(preview(&message(Some("hi"), vec![])), "hi");
    }

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(150);
        let p = preview(&message(Some(&text), vec![]));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn attachment_priority() {
        let m = message(
            None,
            vec![
                attachment("notes.pdf", Some("application/pdf")),
                attachment("memo.ogg", Some("audio/ogg")),
                attachment("cat.png", None),
            ],
        );
        assert_eq!(preview(&m), PHOTO_LABEL);
        let m = message(
            None,
            vec![
                attachment("notes.pdf", None),
                attachment("memo.ogg", Some("audio/ogg")),
            ],
        );
        assert_eq!(preview(&m), VOICE_LABEL);
        let m = message(Some("  "), vec![attachment("notes.pdf", None)]);
        assert_eq!(preview(&m), "notes.pdf");
    }

    #[test]
    fn deleted_overrides_content() {
        let mut m = message(Some("secret"), vec![]);
        m.is_deleted = true;
        assert_eq!(preview(&m), DELETED_LABEL);
    }
}
