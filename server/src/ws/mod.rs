pub mod connection;
pub mod protocol;
pub mod relay;

pub(crate) use connection::ws_handler;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cowrite_core::ids::{DocumentId, PrincipalId};
    use cowrite_core::limiter::RateLimitRule;
    use serde_json::json;

    use crate::test_support::{connect, memory_cluster, memory_state, memory_state_with_config, test_config};

    #[tokio::test]
    async fn two_client_echo_excludes_the_originator() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");
        let mut b = connect(&state, "B", "Bert");

        a.join(&state, "D1").await;
        let frame = a.expect_frame("users-in-document").await;
        let users = frame["data"]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["principalId"], "A");

        b.join(&state, "D1").await;
        let frame = b.expect_frame("users-in-document").await;
        let users = frame["data"]["users"].as_array().unwrap();
        assert_eq!(users.len(), 2);

        // A joined first, so only A hears about B's arrival.
        let frame = a.expect_frame("user-joined").await;
        assert_eq!(frame["data"]["user"]["principalId"], "B");

        a.crdt_update(&state, "D1", "AAEC").await;
        let frame = b.expect_frame("crdt-update").await;
        assert_eq!(frame["data"]["documentId"], "D1");
        assert_eq!(frame["data"]["update"], "AAEC");

        // No self-echo.
        a.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn awareness_updates_relay_like_crdt_updates() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");
        let mut b = connect(&state, "B", "Bert");
        a.join(&state, "D1").await;
        a.expect_frame("users-in-document").await;
        b.join(&state, "D1").await;
        b.expect_frame("users-in-document").await;
        a.expect_frame("user-joined").await;

        b.awareness_update(&state, "D1", "BBDD").await;
        let frame = a.expect_frame("awareness-update").await;
        assert_eq!(frame["data"]["update"], "BBDD");
        b.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn membership_follows_join_and_leave() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");
        let doc = DocumentId::from("D1");

        a.join(&state, "D1").await;
        let sessions = state.presence.list_sessions(&doc).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].principal_id, PrincipalId::from("A"));
        assert!(state.topics.is_subscribed(&doc));

        a.drain();
        a.leave(&state, "D1").await;
        assert!(state.presence.list_sessions(&doc).await.unwrap().is_empty());
        assert!(!state.topics.is_subscribed(&doc));
    }

    #[tokio::test]
    async fn protocol_errors_answer_without_severing() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");

        // Unknown type.
        a.send(&state, json!({"type": "reboot", "data": {}})).await;
        a.expect_frame("error").await;

        // Update before joining.
        a.crdt_update(&state, "D1", "AAEC").await;
        a.expect_frame("error").await;

        // Leave without a join.
        a.leave(&state, "D1").await;
        a.expect_frame("error").await;

        // Mismatched document while joined.
        a.join(&state, "D1").await;
        a.expect_frame("users-in-document").await;
        a.crdt_update(&state, "D2", "AAEC").await;
        a.expect_frame("error").await;

        // The connection is still usable.
        let sessions = state
            .presence
            .list_sessions(&DocumentId::from("D1"))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_trip_blocks_then_recovers() {
        let mut config = test_config();
        config.rate_limit_crdt = RateLimitRule::new(3, 200, 300);
        let (state, _) = memory_state_with_config(config);

        let mut a = connect(&state, "A", "Ada");
        let mut b = connect(&state, "B", "Bert");
        a.join(&state, "D1").await;
        a.expect_frame("users-in-document").await;
        b.join(&state, "D1").await;
        b.expect_frame("users-in-document").await;
        a.expect_frame("user-joined").await;

        for _ in 0..3 {
            a.crdt_update(&state, "D1", "AAEC").await;
            b.expect_frame("crdt-update").await;
        }

        // Fourth within the window: rejected, not published.
        a.crdt_update(&state, "D1", "AAEC").await;
        a.expect_frame("error").await;
        b.assert_silent(Duration::from_millis(80)).await;
        assert_eq!(state.metrics.snapshot().rate_limited, 1);

        // Still blocked.
        a.crdt_update(&state, "D1", "AAEC").await;
        a.expect_frame("error").await;

        // Once the block and window both lapse, traffic flows again.
        tokio::time::sleep(Duration::from_millis(400)).await;
        a.crdt_update(&state, "D1", "AAEC").await;
        b.expect_frame("crdt-update").await;
    }

    #[tokio::test]
    async fn duplicate_join_supersedes_the_previous_socket() {
        let (state, _) = memory_state();
        let doc = DocumentId::from("D3");

        let mut first = connect(&state, "P", "Pat");
        first.join(&state, "D3").await;
        first.expect_frame("users-in-document").await;

        let mut observer = connect(&state, "O", "Obs");
        observer.join(&state, "D3").await;
        observer.expect_frame("users-in-document").await;
        first.expect_frame("user-joined").await;

        let mut second = connect(&state, "P", "Pat");
        second.join(&state, "D3").await;
        second.expect_frame("users-in-document").await;
        // The supersede is an overwrite, not a leave/join pair: peers see
        // one more user-joined announcement for P and no departure.
        observer.expect_frame("user-joined").await;
        first.expect_frame("user-joined").await;

        // One session, owned by the newer socket.
        let sessions = state.presence.list_sessions(&doc).await.unwrap();
        assert_eq!(sessions.len(), 2); // P and the observer
        let pat = sessions
            .iter()
            .find(|s| s.principal_id == PrincipalId::from("P"))
            .unwrap();
        assert_eq!(pat.socket_id, second.socket_id);

        // The superseded socket's updates are still admitted, and fan-out
        // excludes only the originator: the newer device sees them.
        first.drain();
        first.crdt_update(&state, "D3", "AAEC").await;
        second.expect_frame("crdt-update").await;
        observer.expect_frame("crdt-update").await;

        // The old socket disconnecting must not disturb the new session.
        observer.drain();
        first.disconnect(&state).await;
        let sessions = state.presence.list_sessions(&doc).await.unwrap();
        assert!(sessions.iter().any(|s| s.principal_id == PrincipalId::from("P")));
        observer.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn switching_documents_moves_presence_and_subscription() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");

        a.join(&state, "D1").await;
        a.expect_frame("users-in-document").await;
        a.join(&state, "D2").await;
        a.expect_frame("users-in-document").await;

        assert!(state
            .presence
            .list_sessions(&DocumentId::from("D1"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            state
                .presence
                .list_sessions(&DocumentId::from("D2"))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(!state.topics.is_subscribed(&DocumentId::from("D1")));
        assert!(state.topics.is_subscribed(&DocumentId::from("D2")));
    }

    #[tokio::test]
    async fn disconnect_cleans_presence_and_notifies_peers() {
        let (state, _) = memory_state();
        let mut a = connect(&state, "A", "Ada");
        let mut b = connect(&state, "B", "Bert");
        a.join(&state, "D1").await;
        a.expect_frame("users-in-document").await;
        b.join(&state, "D1").await;
        b.expect_frame("users-in-document").await;
        a.expect_frame("user-joined").await;

        b.disconnect(&state).await;
        let frame = a.expect_frame("user-left").await;
        assert_eq!(frame["data"]["user"]["principalId"], "B");

        let sessions = state
            .presence
            .list_sessions(&DocumentId::from("D1"))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(state.sockets.len(), 1);

        // Instance still holds A's session, so the topic stays subscribed.
        assert!(state.topics.is_subscribed(&DocumentId::from("D1")));
        a.disconnect(&state).await;
        assert!(!state.topics.is_subscribed(&DocumentId::from("D1")));
    }

    #[tokio::test]
    async fn cross_instance_fan_out_works_both_ways() {
        let (states, _) = memory_cluster(test_config(), 2);
        let mut a = connect(&states[0], "A", "Ada");
        let mut b = connect(&states[1], "B", "Bert");

        a.join(&states[0], "D1").await;
        a.expect_frame("users-in-document").await;
        b.join(&states[1], "D1").await;
        let frame = b.expect_frame("users-in-document").await;
        assert_eq!(frame["data"]["users"].as_array().unwrap().len(), 2);

        // A hears about B across instances.
        a.expect_frame("user-joined").await;

        a.crdt_update(&states[0], "D1", "AAEC").await;
        let frame = b.expect_frame("crdt-update").await;
        assert_eq!(frame["data"]["update"], "AAEC");

        b.crdt_update(&states[1], "D1", "BBEE").await;
        let frame = a.expect_frame("crdt-update").await;
        assert_eq!(frame["data"]["update"], "BBEE");

        a.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn crashed_instance_sessions_age_out_for_survivors() {
        let (states, _) = memory_cluster(test_config(), 2);

        let a = connect(&states[0], "A", "Ada");
        a.join(&states[0], "D4").await;

        // Instance 0 "crashes": no cleanup runs. A surviving instance's
        // sweep reclaims the session once last_active falls behind the TTL
        // horizon (a short-TTL registry over the same store stands in for
        // the passage of a full window).
        let sweeper = cowrite_core::presence::PresenceRegistry::new(
            states[1].cache.clone(),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = sweeper.sweep_stale().await.unwrap();
        assert_eq!(report.sessions_removed, 1);

        // A later joiner on the survivor sees a clean roster.
        let mut b = connect(&states[1], "B", "Bert");
        b.join(&states[1], "D4").await;
        let frame = b.expect_frame("users-in-document").await;
        let users = frame["data"]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["principalId"], "B");
    }
}
