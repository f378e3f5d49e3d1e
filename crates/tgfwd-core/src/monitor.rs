//! Periodic session health checks.
//!
//! Independent of the forwarder: the monitor only demotes the user state
//! and notifies; the supervisor reacts on the next interaction.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    botapi::Notifier,
    domain::{UserId, UserState},
    repo::UserRepo,
    session_store::SessionStore,
};

pub struct SessionMonitor {
    store: Arc<SessionStore>,
    users: Arc<dyn UserRepo>,
    notifier: Arc<dyn Notifier>,
    check_interval: Duration,
}

impl SessionMonitor {
    pub fn new(
        store: Arc<SessionStore>,
        users: Arc<dyn UserRepo>,
        notifier: Arc<dyn Notifier>,
        check_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            users,
            notifier,
            check_interval,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
            self.check_once().await;
        }
        debug!("session monitor stopped");
    }

    /// One sweep over users in `running` state.
    pub async fn check_once(&self) {
        let running = match self.users.by_state(UserState::Running).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "session sweep failed");
                return;
            }
        };

        for user in running {
            if self.store.verify(user.id).await {
                continue;
            }
            warn!(user_id = user.id.0, "session no longer valid");
            self.demote(user.id).await;
        }
    }

    async fn demote(&self, user_id: UserId) {
        if let Err(e) = self
            .users
            .set_state(user_id, UserState::SessionExpired)
            .await
        {
            warn!(user_id = user_id.0, error = %e, "failed to demote user");
            return;
        }
        self.notifier
            .notify(
                user_id,
                "Your session has expired. Please sign in again to resume forwarding.",
            )
            .await;
    }
}
