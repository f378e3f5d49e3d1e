use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream-assigned user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Chat id (numeric, wire form for channels).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Message id (numeric, per chat).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation state of an enrolled user, persisted on the user row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserState {
    Idle,
    AwaitingCode,
    Awaiting2fa,
    AwaitingQr,
    MainMenu,
    Running,
    SessionExpired,
}

impl UserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::Idle => "idle",
            UserState::AwaitingCode => "awaiting_code",
            UserState::Awaiting2fa => "awaiting_2fa",
            UserState::AwaitingQr => "awaiting_qr",
            UserState::MainMenu => "main_menu",
            UserState::Running => "running",
            UserState::SessionExpired => "session_expired",
        }
    }

    /// Unknown tags fall back to `Idle` so old rows never wedge the engine.
    pub fn parse(s: &str) -> Self {
        match s {
            "awaiting_code" => UserState::AwaitingCode,
            "awaiting_2fa" => UserState::Awaiting2fa,
            "awaiting_qr" => UserState::AwaitingQr,
            "main_menu" => UserState::MainMenu,
            "running" => UserState::Running,
            "session_expired" => UserState::SessionExpired,
            _ => UserState::Idle,
        }
    }
}

/// Classification of a channel post for forwarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    VideoNote,
    Sticker,
    Animation,
    Poll,
    Location,
    Contact,
    Unsupported,
}

impl MessageKind {
    /// Kinds that carry a downloadable media payload.
    pub fn has_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Photo
                | MessageKind::Video
                | MessageKind::Document
                | MessageKind::Audio
                | MessageKind::Voice
                | MessageKind::VideoNote
                | MessageKind::Sticker
                | MessageKind::Animation
        )
    }

    /// Kinds a media group (album) may contain.
    pub fn album_eligible(&self) -> bool {
        matches!(
            self,
            MessageKind::Photo | MessageKind::Video | MessageKind::Document | MessageKind::Audio
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollSpec {
    pub question: String,
    pub options: Vec<String>,
    pub is_anonymous: bool,
    /// "regular" or "quiz".
    pub kind: String,
    pub allows_multiple_answers: bool,
    #[serde(default)]
    pub correct_option: Option<u32>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phone_number: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// A channel post normalised at the MTProto boundary.
///
/// `text` is the body for text posts and the caption for media posts.
/// Formatting entities are carried opaquely and handed back to the
/// upstream adapter untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelPost {
    pub chat_id: ChatId,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub chat_handle: Option<String>,
    pub msg_id: MessageId,
    #[serde(default)]
    pub group_id: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Option<serde_json::Value>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub poll: Option<PollSpec>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub contact: Option<ContactInfo>,
}

impl ChannelPost {
    pub fn title(&self) -> &str {
        self.chat_title
            .as_deref()
            .or(self.chat_handle.as_deref())
            .unwrap_or("Unknown")
    }

    /// Public link to the original post; `t.me/c/...` for private channels.
    pub fn link(&self) -> String {
        match &self.chat_handle {
            Some(handle) => format!("https://t.me/{}/{}", handle, self.msg_id),
            None => format!(
                "https://t.me/c/{}/{}",
                crate::ident::bare_channel_id(self.chat_id),
                self.msg_id
            ),
        }
    }
}

/// Rough chat type, used to reject non-channel identifiers at intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Channel,
    Supergroup,
    Group,
    User,
    Bot,
}

/// Uniform result of resolving a channel identifier upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatDescriptor {
    pub wire_id: ChatId,
    pub title: String,
    #[serde(default)]
    pub handle: Option<String>,
    pub kind: ChatKind,
}

/// Result of requesting a login code for a phone number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentCode {
    pub phone_code_hash: String,
    /// Where the code was delivered ("app", "sms", ...).
    pub delivery: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInOutcome {
    Authorized,
    NeedsPassword,
}

/// Short-lived login token for the QR flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QrToken {
    /// Url-safe base64 token, rendered as `tg://login?token=...`.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrPollOutcome {
    Pending,
    Authorized,
    NeedsPassword,
}

/// One item of a rebuilt album, sent to a destination channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlbumPart {
    pub msg_id: MessageId,
    pub kind: MessageKind,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub entities: Option<serde_json::Value>,
}
