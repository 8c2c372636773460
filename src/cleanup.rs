//! Background sweep for sessions that have gone quiet: ends them on the
//! hub (so any lingering connections are notified and closed) and soft-
//! ends them in the durable store (revokes invite tokens, marks non-host
//! participants left).

use std::sync::Arc;
use std::time::Duration;

use crate::hub::Hub;
use crate::repo::SessionRepository;

pub struct CleanupService {
    repo: Arc<dyn SessionRepository>,
    hub: Arc<Hub>,
    interval: Duration,
    inactivity_threshold: Duration,
}

impl CleanupService {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        hub: Arc<Hub>,
        interval: Duration,
        inactivity_threshold: Duration,
    ) -> Self {
        Self { repo, hub, interval, inactivity_threshold }
    }

    /// Runs forever, sweeping every tick. Spawn this as a background task.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep_once().await {
                tracing::error!(error = %err, "cleanup sweep failed to list stale sessions");
            }
        }
    }

    async fn sweep_once(&self) -> anyhow::Result<()> {
        let threshold = chrono::Utc::now()
            - chrono::Duration::from_std(self.inactivity_threshold).unwrap_or(chrono::Duration::zero());
        let stale = self.repo.list_stale_sessions(threshold).await?;

        for session in stale {
            self.hub.end_session(session.id, "inactivity").await;

            if let Err(err) = self.repo.end_session(session.id).await {
                tracing::error!(session_id = %session.id, error = %err, "failed to mark stale session ended");
                continue;
            }
            if let Err(err) = self.repo.soft_end(session.id).await {
                tracing::error!(session_id = %session.id, error = %err, "failed to soft-end stale session");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::lock::InMemoryLockStore;
    use crate::paste::Detector;
    use crate::repo::testing::InMemoryRepo;

    /// Wraps an `InMemoryRepo`, failing `end_session` for one chosen
    /// session id so the sweep's per-session error isolation can be
    /// exercised without a real, flaky backing store.
    struct FlakyEndRepo {
        inner: InMemoryRepo,
        fails_for: Uuid,
    }

    #[async_trait::async_trait]
    impl SessionRepository for FlakyEndRepo {
        async fn create_session(&self, h: Option<Uuid>, d: bool) -> crate::error::CoreResult<crate::model::Session> {
            self.inner.create_session(h, d).await
        }
        async fn get_session(&self, id: Uuid) -> crate::error::CoreResult<Option<crate::model::Session>> {
            self.inner.get_session(id).await
        }
        async fn update_session_code(&self, id: Uuid, code: &str) -> crate::error::CoreResult<()> {
            self.inner.update_session_code(id, code).await
        }
        async fn end_session(&self, id: Uuid) -> crate::error::CoreResult<()> {
            if id == self.fails_for {
                return Err(crate::error::CoreError::Server("simulated durable-store failure".to_string()));
            }
            self.inner.end_session(id).await
        }
        async fn list_discoverable(&self, l: i64, o: i64) -> crate::error::CoreResult<(Vec<crate::model::Session>, i64)> {
            self.inner.list_discoverable(l, o).await
        }
        async fn touch_last_activity(&self, id: Uuid) -> crate::error::CoreResult<()> {
            self.inner.touch_last_activity(id).await
        }
        async fn list_stale_sessions(&self, t: chrono::DateTime<chrono::Utc>) -> crate::error::CoreResult<Vec<crate::model::Session>> {
            self.inner.list_stale_sessions(t).await
        }
        async fn upsert_authenticated_participant(
            &self,
            s: Uuid,
            u: Uuid,
            n: &str,
            r: crate::model::ParticipantRole,
        ) -> crate::error::CoreResult<crate::model::Participant> {
            self.inner.upsert_authenticated_participant(s, u, n, r).await
        }
        async fn insert_anonymous_participant(
            &self,
            s: Uuid,
            n: &str,
            r: crate::model::ParticipantRole,
            e: chrono::DateTime<chrono::Utc>,
        ) -> crate::error::CoreResult<crate::model::Participant> {
            self.inner.insert_anonymous_participant(s, n, r, e).await
        }
        async fn list_combined_participants(&self, s: Uuid) -> crate::error::CoreResult<Vec<crate::model::Participant>> {
            self.inner.list_combined_participants(s).await
        }
        async fn remove_participant(&self, s: Uuid, u: Option<Uuid>) -> crate::error::CoreResult<()> {
            self.inner.remove_participant(s, u).await
        }
        async fn count_active_participants(&self, s: Uuid) -> crate::error::CoreResult<i64> {
            self.inner.count_active_participants(s).await
        }
        async fn mark_non_host_participants_left(&self, s: Uuid) -> crate::error::CoreResult<()> {
            self.inner.mark_non_host_participants_left(s).await
        }
        async fn create_invite_token(
            &self,
            s: Uuid,
            r: crate::model::ParticipantRole,
            m: Option<i32>,
            e: Option<chrono::DateTime<chrono::Utc>>,
        ) -> crate::error::CoreResult<crate::model::InviteToken> {
            self.inner.create_invite_token(s, r, m, e).await
        }
        async fn get_invite_token(&self, t: &str) -> crate::error::CoreResult<Option<crate::model::InviteToken>> {
            self.inner.get_invite_token(t).await
        }
        async fn increment_invite_uses(&self, t: &str) -> crate::error::CoreResult<()> {
            self.inner.increment_invite_uses(t).await
        }
        async fn revoke_all_tokens(&self, s: Uuid) -> crate::error::CoreResult<()> {
            self.inner.revoke_all_tokens(s).await
        }
        async fn insert_message(&self, m: crate::model::Message) -> crate::error::CoreResult<crate::model::Message> {
            self.inner.insert_message(m).await
        }
        async fn list_messages(&self, s: Uuid, l: i64) -> crate::error::CoreResult<Vec<crate::model::Message>> {
            self.inner.list_messages(s, l).await
        }
    }

    #[tokio::test]
    async fn sweep_ends_every_stale_session_even_if_one_fails() {
        let inner = InMemoryRepo::new();
        let detector = Arc::new(Detector::new(Arc::new(InMemoryLockStore::new()), None, None));

        let stale_cutoff = chrono::Utc::now() - chrono::Duration::hours(2);
        let mut a = inner.create_session(None, false).await.unwrap();
        a.last_activity = stale_cutoff;
        inner.seed(a.clone());
        let mut b = inner.create_session(None, false).await.unwrap();
        b.last_activity = stale_cutoff;
        inner.seed(b.clone());

        let repo = Arc::new(FlakyEndRepo { inner, fails_for: a.id });
        let repo_dyn: Arc<dyn SessionRepository> = repo.clone();
        let hub = Arc::new(Hub::new(repo_dyn.clone(), detector, 100, 100, None));
        let cleanup = CleanupService::new(repo_dyn, hub, Duration::from_secs(3600), Duration::from_secs(3600));

        cleanup.sweep_once().await.unwrap();

        assert!(
            repo.get_session(a.id).await.unwrap().unwrap().is_active,
            "a's end_session failed, so it must still be active"
        );
        assert!(
            !repo.get_session(b.id).await.unwrap().unwrap().is_active,
            "b's failure-free end_session must still have gone through"
        );
    }
}
