//! User-facing identifier parsing: channel references and phone numbers.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{domain::ChatId, errors::Error, Result};

/// Channel ids on the wire carry a `-100` prefix over the bare id.
const CHANNEL_WIRE_OFFSET: i64 = 1_000_000_000_000;

/// A channel identifier as the user may type it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ChannelRef {
    /// Public handle, without the `@`.
    Handle(String),
    /// Numeric id, normalised to the wire (`-100`-prefixed) form.
    Id(ChatId),
    /// Private invite hash from `t.me/+hash` or `t.me/joinchat/hash`.
    Invite(String),
}

fn invite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:https?://)?(?:t\.me|telegram\.me)/(?:\+|joinchat/)([A-Za-z0-9_-]+)/?$")
            .expect("invite pattern")
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:https?://)?(?:t\.me|telegram\.me)/([a-zA-Z][a-zA-Z0-9_]{3,31})/?$")
            .expect("link pattern")
    })
}

fn handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@?([a-zA-Z][a-zA-Z0-9_]{3,31})$").expect("handle pattern"))
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d{6,14}$").expect("numeric pattern"))
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+\d{10,15}$").expect("phone pattern"))
}

/// Parse a channel identifier: `@handle`, `t.me/handle`, a raw numeric id
/// (with or without the wire prefix), or a private invite link.
pub fn parse_channel_ref(input: &str) -> Result<ChannelRef> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InputInvalid("empty channel identifier".to_string()));
    }

    if let Some(caps) = invite_re().captures(s) {
        return Ok(ChannelRef::Invite(caps[1].to_string()));
    }
    if let Some(caps) = link_re().captures(s) {
        return Ok(ChannelRef::Handle(caps[1].to_string()));
    }
    if numeric_re().is_match(s) {
        let id: i64 = s
            .parse()
            .map_err(|_| Error::InputInvalid(format!("bad channel id: {s}")))?;
        return Ok(ChannelRef::Id(to_wire_id(id)));
    }
    if let Some(caps) = handle_re().captures(s) {
        return Ok(ChannelRef::Handle(caps[1].to_string()));
    }

    Err(Error::InputInvalid(format!(
        "unrecognised channel identifier: {s}"
    )))
}

/// Normalise a channel id to the wire (`-100`-prefixed) form.
pub fn to_wire_id(id: i64) -> ChatId {
    if id <= -CHANNEL_WIRE_OFFSET {
        ChatId(id)
    } else if id < 0 {
        ChatId(-CHANNEL_WIRE_OFFSET - (-id))
    } else {
        ChatId(-CHANNEL_WIRE_OFFSET - id)
    }
}

/// Strip the wire prefix; used for `t.me/c/...` links.
pub fn bare_channel_id(id: ChatId) -> i64 {
    if id.0 <= -CHANNEL_WIRE_OFFSET {
        -id.0 - CHANNEL_WIRE_OFFSET
    } else {
        id.0.abs()
    }
}

/// Strip spaces, dashes and parentheses, prepend `+` if missing, and
/// validate the international format.
pub fn normalize_phone(input: &str) -> Result<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let cleaned = if cleaned.starts_with('+') {
        cleaned
    } else {
        format!("+{cleaned}")
    };

    if phone_re().is_match(&cleaned) {
        Ok(cleaned)
    } else {
        Err(Error::InputInvalid(format!("bad phone number: {input}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handles_and_links() {
        assert_eq!(
            parse_channel_ref("@some_channel").unwrap(),
            ChannelRef::Handle("some_channel".to_string())
        );
        assert_eq!(
            parse_channel_ref("https://t.me/some_channel").unwrap(),
            ChannelRef::Handle("some_channel".to_string())
        );
        assert_eq!(
            parse_channel_ref("t.me/some_channel/").unwrap(),
            ChannelRef::Handle("some_channel".to_string())
        );
    }

    #[test]
    fn parses_invite_links() {
        assert_eq!(
            parse_channel_ref("https://t.me/+AbCd_123").unwrap(),
            ChannelRef::Invite("AbCd_123".to_string())
        );
        assert_eq!(
            parse_channel_ref("t.me/joinchat/XyZ-9").unwrap(),
            ChannelRef::Invite("XyZ-9".to_string())
        );
    }

    #[test]
    fn numeric_ids_are_normalised_to_wire_form() {
        assert_eq!(
            parse_channel_ref("1234567890").unwrap(),
            ChannelRef::Id(ChatId(-1001234567890))
        );
        assert_eq!(
            parse_channel_ref("-1001234567890").unwrap(),
            ChannelRef::Id(ChatId(-1001234567890))
        );
    }

    #[test]
    fn bare_id_round_trips() {
        assert_eq!(bare_channel_id(ChatId(-1001234567890)), 1234567890);
        assert_eq!(to_wire_id(1234567890), ChatId(-1001234567890));
    }

    #[test]
    fn rejects_garbage_identifiers() {
        assert!(parse_channel_ref("").is_err());
        assert!(parse_channel_ref("ab").is_err());
        assert!(parse_channel_ref("not a channel!").is_err());
    }

    #[test]
    fn normalizes_phones() {
        assert_eq!(
            normalize_phone("+7 (999) 123-45-67").unwrap(),
            "+79991234567"
        );
        assert_eq!(normalize_phone("79991234567").unwrap(), "+79991234567");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+1 800 FLOWERS").is_err());
    }
}
