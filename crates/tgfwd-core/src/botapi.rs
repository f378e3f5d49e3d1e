//! Bot API egress port (DM fallback) and the owner notifier.

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    Result,
};

/// One media payload re-uploaded through the Bot API from memory.
#[derive(Clone, Debug)]
pub struct DmMedia {
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
}

/// Bot API surface the dispatcher needs for DM egress. Captions are HTML.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn send_html(&self, chat: ChatId, html: &str) -> Result<MessageId>;

    async fn send_media(
        &self,
        chat: ChatId,
        media: DmMedia,
        caption_html: Option<&str>,
    ) -> Result<MessageId>;

    /// Sends an album; the caption lands on the first item. Returns the
    /// first forwarded id.
    async fn send_media_group(
        &self,
        chat: ChatId,
        media: Vec<DmMedia>,
        caption_html: Option<&str>,
    ) -> Result<MessageId>;
}

/// Injected by the chat-UI collaborator; must never raise.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, text: &str);
}
