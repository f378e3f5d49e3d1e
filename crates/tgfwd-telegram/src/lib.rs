//! Bot API adapter (teloxide).
//!
//! Implements the `tgfwd-core` DM-egress port and the owner notifier
//! over the Telegram Bot API. Media arrives as in-memory buffers and is
//! uploaded directly.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InputFile, InputMedia, InputMediaAudio, InputMediaDocument, InputMediaPhoto,
        InputMediaVideo, ParseMode},
    RequestError,
};
use tracing::warn;

use tgfwd_core::{
    botapi::{BotApi, DmMedia, Notifier},
    domain::{ChatId, MessageId, MessageKind, UserId},
    errors::Error,
    Result,
};

#[derive(Clone)]
pub struct TelegramEgress {
    bot: Bot,
}

impl TelegramEgress {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat.0)
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::RetryAfter(duration) => Error::RateLimited {
                retry_after: duration.as_secs().max(1),
            },
            other => Error::Transport(format!("bot api: {other}")),
        }
    }

    fn input_file(media: &DmMedia) -> InputFile {
        let file = InputFile::memory(media.bytes.clone());
        match &media.file_name {
            Some(name) => file.file_name(name.clone()),
            None => file,
        }
    }
}

#[async_trait]
impl BotApi for TelegramEgress {
    async fn send_html(&self, chat: ChatId, html: &str) -> Result<MessageId> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat), html.to_string())
            .parse_mode(ParseMode::Html)
            .await
            .map_err(Self::map_err)?;
        Ok(MessageId(i64::from(msg.id.0)))
    }

    async fn send_media(
        &self,
        chat: ChatId,
        media: DmMedia,
        caption_html: Option<&str>,
    ) -> Result<MessageId> {
        let chat_id = Self::tg_chat(chat);
        let file = Self::input_file(&media);
        let caption = caption_html.map(|c| c.to_string());

        let msg = match media.kind {
            MessageKind::Photo => {
                let mut req = self.bot.send_photo(chat_id, file).parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
            MessageKind::Video => {
                let mut req = self.bot.send_video(chat_id, file).parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
            MessageKind::Animation => {
                let mut req = self
                    .bot
                    .send_animation(chat_id, file)
                    .parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
            MessageKind::Audio => {
                let mut req = self.bot.send_audio(chat_id, file).parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
            MessageKind::Voice => {
                let mut req = self.bot.send_voice(chat_id, file).parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
            MessageKind::VideoNote => {
                // Video notes carry no caption; send it as a follow-up.
                let msg = self
                    .bot
                    .send_video_note(chat_id, file)
                    .await
                    .map_err(Self::map_err)?;
                if let Some(caption) = caption {
                    let _ = self
                        .bot
                        .send_message(chat_id, caption)
                        .parse_mode(ParseMode::Html)
                        .await
                        .map_err(Self::map_err)?;
                }
                msg
            }
            MessageKind::Sticker => {
                let msg = self
                    .bot
                    .send_sticker(chat_id, file)
                    .await
                    .map_err(Self::map_err)?;
                if let Some(caption) = caption {
                    let _ = self
                        .bot
                        .send_message(chat_id, caption)
                        .parse_mode(ParseMode::Html)
                        .await
                        .map_err(Self::map_err)?;
                }
                msg
            }
            _ => {
                let mut req = self
                    .bot
                    .send_document(chat_id, file)
                    .parse_mode(ParseMode::Html);
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await.map_err(Self::map_err)?
            }
        };

        Ok(MessageId(i64::from(msg.id.0)))
    }

    async fn send_media_group(
        &self,
        chat: ChatId,
        media: Vec<DmMedia>,
        caption_html: Option<&str>,
    ) -> Result<MessageId> {
        let mut group = Vec::with_capacity(media.len());
        for (index, item) in media.iter().enumerate() {
            let file = Self::input_file(item);
            let caption = if index == 0 {
                caption_html.map(|c| c.to_string())
            } else {
                None
            };

            let entry = match item.kind {
                MessageKind::Photo => {
                    let mut m = InputMediaPhoto::new(file).parse_mode(ParseMode::Html);
                    if let Some(caption) = caption {
                        m = m.caption(caption);
                    }
                    InputMedia::Photo(m)
                }
                MessageKind::Video => {
                    let mut m = InputMediaVideo::new(file).parse_mode(ParseMode::Html);
                    if let Some(caption) = caption {
                        m = m.caption(caption);
                    }
                    InputMedia::Video(m)
                }
                MessageKind::Audio => {
                    let mut m = InputMediaAudio::new(file).parse_mode(ParseMode::Html);
                    if let Some(caption) = caption {
                        m = m.caption(caption);
                    }
                    InputMedia::Audio(m)
                }
                _ => {
                    let mut m = InputMediaDocument::new(file).parse_mode(ParseMode::Html);
                    if let Some(caption) = caption {
                        m = m.caption(caption);
                    }
                    InputMedia::Document(m)
                }
            };
            group.push(entry);
        }

        let sent = self
            .bot
            .send_media_group(Self::tg_chat(chat), group)
            .await
            .map_err(Self::map_err)?;
        sent.first()
            .map(|m| MessageId(i64::from(m.id.0)))
            .ok_or_else(|| Error::Internal("media group send returned no messages".to_string()))
    }
}

/// Owner notifications through the same bot. Failures are logged and
/// swallowed; notification must never take the engine down.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_id: UserId, text: &str) {
        let result = self
            .bot
            .send_message(teloxide::types::ChatId(user_id.0), text.to_string())
            .await;
        if let Err(e) = result {
            warn!(user_id = user_id.0, error = %e, "owner notification failed");
        }
    }
}
