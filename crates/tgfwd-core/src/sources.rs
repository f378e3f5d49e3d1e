//! Source intake and management: validation, upstream resolution,
//! limits, reactivation, listing.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::Config,
    domain::{ChatKind, UserId},
    errors::Error,
    ident::parse_channel_ref,
    mtproto::ClientRegistry,
    repo::{Source, SourceRepo},
    session_store::SessionStore,
    Result,
};

#[derive(Clone, Debug)]
pub struct RejectedSource {
    pub input: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct SourceIntake {
    pub added: Vec<Source>,
    pub rejected: Vec<RejectedSource>,
}

pub struct SourceService {
    cfg: Arc<Config>,
    store: Arc<SessionStore>,
    registry: Arc<ClientRegistry>,
    sources: Arc<dyn SourceRepo>,
}

impl SourceService {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<SessionStore>,
        registry: Arc<ClientRegistry>,
        sources: Arc<dyn SourceRepo>,
    ) -> Self {
        Self {
            cfg,
            store,
            registry,
            sources,
        }
    }

    /// Add sources from a list of identifier strings. Each input is
    /// validated and resolved independently; failures land in
    /// `rejected` with a reason instead of aborting the batch.
    pub async fn add_many(&self, user_id: UserId, inputs: &[String]) -> Result<SourceIntake> {
        let mut count = self.sources.count_by_user(user_id).await?;
        if count >= self.cfg.max_sources_per_user {
            return Err(Error::InputInvalid(format!(
                "source limit reached ({})",
                self.cfg.max_sources_per_user
            )));
        }

        let session = self
            .store
            .load(user_id)
            .await?
            .ok_or(Error::NoSession(user_id.0))?;
        let client = self.registry.get(user_id, Some(session)).await?;
        client.connect().await?;

        let mut intake = SourceIntake::default();
        for input in inputs {
            if count >= self.cfg.max_sources_per_user {
                intake.rejected.push(RejectedSource {
                    input: input.clone(),
                    reason: format!("source limit reached ({})", self.cfg.max_sources_per_user),
                });
                continue;
            }

            let reference = match parse_channel_ref(input) {
                Ok(r) => r,
                Err(e) => {
                    intake.rejected.push(RejectedSource {
                        input: input.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let chat = match client.resolve_chat(&reference).await {
                Ok(chat) => chat,
                Err(e) => {
                    warn!(user_id = user_id.0, input = %input, error = %e, "source resolution failed");
                    intake.rejected.push(RejectedSource {
                        input: input.clone(),
                        reason: "channel not found or not accessible".to_string(),
                    });
                    continue;
                }
            };

            if !matches!(chat.kind, ChatKind::Channel | ChatKind::Supergroup) {
                intake.rejected.push(RejectedSource {
                    input: input.clone(),
                    reason: "not a channel".to_string(),
                });
                continue;
            }

            match self.sources.by_channel(user_id, chat.wire_id).await? {
                Some(existing) if existing.is_active => {
                    intake.rejected.push(RejectedSource {
                        input: input.clone(),
                        reason: "already added".to_string(),
                    });
                }
                Some(existing) => {
                    self.sources.set_active(existing.id, true).await?;
                    info!(
                        user_id = user_id.0,
                        source_id = existing.id,
                        "source reactivated"
                    );
                    intake.added.push(Source {
                        is_active: true,
                        ..existing
                    });
                    count += 1;
                }
                None => {
                    let source = self.sources.add(user_id, &chat).await?;
                    info!(
                        user_id = user_id.0,
                        source_id = source.id,
                        channel_id = chat.wire_id.0,
                        title = %chat.title,
                        "source added"
                    );
                    intake.added.push(source);
                    count += 1;
                }
            }
        }

        info!(
            user_id = user_id.0,
            added = intake.added.len(),
            rejected = intake.rejected.len(),
            "source intake complete"
        );
        Ok(intake)
    }

    /// Bulk intake from an uploaded text or CSV payload: one identifier
    /// per line, first column for CSV, `#` comment lines skipped.
    pub async fn add_from_file(
        &self,
        user_id: UserId,
        content: &[u8],
        filename: &str,
    ) -> Result<SourceIntake> {
        let text = String::from_utf8_lossy(content);
        let csv = filename.to_lowercase().ends_with(".csv");

        let inputs: Vec<String> = text
            .lines()
            .map(|line| {
                let line = line.trim();
                if csv {
                    line.split(',').next().unwrap_or("").trim()
                } else {
                    line
                }
            })
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_string())
            .collect();

        if inputs.is_empty() {
            return Err(Error::InputInvalid(
                "the file contains no channel identifiers".to_string(),
            ));
        }

        self.add_many(user_id, &inputs).await
    }

    /// Deactivate a source owned by the user.
    pub async fn remove(&self, user_id: UserId, source_id: i64) -> Result<bool> {
        let Some(source) = self.sources.get(source_id).await? else {
            return Ok(false);
        };
        if source.user_id != user_id {
            return Ok(false);
        }
        self.sources.set_active(source_id, false).await?;
        info!(user_id = user_id.0, source_id, "source removed");
        Ok(true)
    }

    /// Paginated listing (1-indexed pages) plus the total count.
    pub async fn list(
        &self,
        user_id: UserId,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Source>, i64)> {
        let offset = (page.max(1) - 1) * page_size;
        let sources = self
            .sources
            .by_user(user_id, false, page_size, offset)
            .await?;
        let total = self.sources.count_by_user(user_id).await?;
        Ok((sources, total))
    }

    pub async fn active(&self, user_id: UserId) -> Result<Vec<Source>> {
        self.sources
            .by_user(user_id, true, self.cfg.max_sources_per_user, 0)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::crypto::CryptoBox;
    use crate::domain::{ChatDescriptor, ChatId};
    use crate::testutil::{FakeConnector, FakeMt, MemStore};

    const CHAT: i64 = -1001234567890;

    struct Rig {
        service: SourceService,
        client: Arc<FakeMt>,
        mem: Arc<MemStore>,
    }

    fn rig() -> Rig {
        let client = Arc::new(FakeMt::default());
        client.add_chat(ChatDescriptor {
            wire_id: ChatId(CHAT),
            title: "News".to_string(),
            handle: Some("newschan".to_string()),
            kind: ChatKind::Channel,
        });
        let connector = FakeConnector::with_template(client.clone());
        let mem = Arc::new(MemStore::default());
        let store = Arc::new(SessionStore::new(
            CryptoBox::new("master"),
            mem.clone(),
            connector.clone(),
        ));
        let service = SourceService::new(
            Arc::new(test_config()),
            store.clone(),
            Arc::new(ClientRegistry::new(connector)),
            mem.clone(),
        );
        Rig {
            service,
            client,
            mem,
        }
    }

    async fn with_session(rig: &Rig, user: UserId) {
        let store = SessionStore::new(
            CryptoBox::new("master"),
            rig.mem.clone(),
            FakeConnector::with_template(rig.client.clone()),
        );
        store.save(user, "session").await.unwrap();
    }

    #[tokio::test]
    async fn mixed_batch_reports_per_item_outcomes() {
        let rig = rig();
        let user = UserId(1);
        with_session(&rig, user).await;

        let intake = rig
            .service
            .add_many(
                user,
                &[
                    "@newschan".to_string(),
                    "@missing".to_string(),
                    "garbage!!".to_string(),
                ],
            )
            .await
            .unwrap();

        assert_eq!(intake.added.len(), 1);
        assert_eq!(intake.added[0].channel_id, ChatId(CHAT));
        assert_eq!(intake.rejected.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_is_rejected_and_inactive_is_reactivated() {
        let rig = rig();
        let user = UserId(1);
        with_session(&rig, user).await;

        let first = rig
            .service
            .add_many(user, &["@newschan".to_string()])
            .await
            .unwrap();
        let source_id = first.added[0].id;

        let dup = rig
            .service
            .add_many(user, &["@newschan".to_string()])
            .await
            .unwrap();
        assert!(dup.added.is_empty());
        assert_eq!(dup.rejected[0].reason, "already added");

        assert!(rig.service.remove(user, source_id).await.unwrap());
        let again = rig
            .service
            .add_many(user, &["@newschan".to_string()])
            .await
            .unwrap();
        assert_eq!(again.added.len(), 1);
        assert_eq!(again.added[0].id, source_id);
    }

    #[tokio::test]
    async fn non_channels_are_rejected() {
        let rig = rig();
        let user = UserId(1);
        with_session(&rig, user).await;
        rig.client.add_chat(ChatDescriptor {
            wire_id: ChatId(4242),
            title: "Some Bot".to_string(),
            handle: Some("somebot".to_string()),
            kind: ChatKind::Bot,
        });

        let intake = rig
            .service
            .add_many(user, &["@somebot".to_string()])
            .await
            .unwrap();
        assert!(intake.added.is_empty());
        assert_eq!(intake.rejected[0].reason, "not a channel");
    }

    #[tokio::test]
    async fn file_intake_skips_comments_and_takes_csv_first_column() {
        let rig = rig();
        let user = UserId(1);
        with_session(&rig, user).await;

        let content = b"# my channels\n@newschan, some note\n\n";
        let intake = rig
            .service
            .add_from_file(user, content, "channels.csv")
            .await
            .unwrap();
        assert_eq!(intake.added.len(), 1);

        let err = rig
            .service
            .add_from_file(user, b"# only comments\n", "list.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[tokio::test]
    async fn intake_requires_a_session() {
        let rig = rig();
        let err = rig
            .service
            .add_many(UserId(9), &["@newschan".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSession(9)));
    }
}
