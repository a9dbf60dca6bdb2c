use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use relay_core::{ClientPacket, ConnectionId, Delivery, NotificationPacket, SessionId};
use relay_store::SessionStore;

use crate::error::{FanoutError, Result};
use crate::registry::SessionRegistry;

/// What the socket writer should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Frames a client may send after connecting.
///
/// A frame naming an `event` is always an event, even if it also carries a token.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ClientCommand {
    Event { event: String },
    Authenticate { token: String },
}

/// Routes notification packets to admitted websocket connections.
pub struct FanoutService {
    sessions: Mutex<SessionRegistry>,
    connections: DashMap<ConnectionId, mpsc::Sender<Outbound>>,
    store: Arc<dyn SessionStore>,
    send_queue: usize,
}

impl FanoutService {
    pub fn new(store: Arc<dyn SessionStore>, max_sessions: usize, send_queue: usize) -> Self {
        Self {
            sessions: Mutex::new(SessionRegistry::new(max_sessions)),
            connections: DashMap::new(),
            store,
            send_queue: send_queue.max(1),
        }
    }

    /// Track a new open connection. Nothing is delivered to it until it is admitted.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.send_queue);
        self.connections.insert(id.clone(), tx);
        debug!(connection_id = %id, "connection opened");
        (id, rx)
    }

    /// Forget a closed connection and any session bound to it.
    pub fn disconnect(&self, connection: &ConnectionId) {
        self.connections.remove(connection);
        if let Some(session) = self.sessions.lock().remove_connection(connection) {
            debug!(connection_id = %connection, session_id = %session.id, "session closed with connection");
        }
    }

    /// Check `token` once against the session store and register a session.
    ///
    /// On rejection the client is told and stays connected so it can retry.
    #[instrument(skip(self, connection, token), fields(connection_id = %connection))]
    pub async fn authenticate(&self, connection: &ConnectionId, token: &str) -> Result<SessionId> {
        if !self.connections.contains_key(connection) {
            return Err(FanoutError::UnknownConnection(connection.clone()));
        }

        let store = Arc::clone(&self.store);
        let candidate = token.to_owned();
        let valid = match tokio::task::spawn_blocking(move || store.is_valid(&candidate)).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(e)) => {
                warn!(error = %e, "session store lookup failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "session store lookup panicked");
                false
            }
        };

        if !valid {
            info!("authentication failed");
            self.send(connection, Outbound::Text(auth_failed_frame()));
            return Err(FanoutError::AuthenticationFailed);
        }

        let (id, evicted) = self.sessions.lock().admit(token, connection.clone());
        for session in evicted {
            debug!(session_id = %session.id, connection_id = %session.connection, "session evicted at capacity");
        }
        info!(session_id = %id, "session admitted");
        Ok(id)
    }

    /// Invalidate the connection's session and close the connection.
    pub fn logout(&self, connection: &ConnectionId) {
        let session = {
            let mut sessions = self.sessions.lock();
            let id = sessions.for_connection(connection).map(|s| s.id.clone());
            id.and_then(|id| sessions.invalidate(&id))
        };
        if let Some(session) = session {
            info!(session_id = %session.id, connection_id = %connection, "session logged out");
        }
        self.close(connection);
    }

    /// Invalidate every session bound to `token` and force their connections closed.
    pub fn invalidate_token(&self, token: &str) -> usize {
        let dropped = self.sessions.lock().invalidate_token(token);
        for session in &dropped {
            info!(session_id = %session.id, "session invalidated");
            self.close(&session.connection);
        }
        dropped.len()
    }

    /// Apply a text frame received from a client.
    pub async fn handle_client_text(&self, connection: &ConnectionId, text: &str) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(ClientCommand::Authenticate { token }) => {
                let _ = self.authenticate(connection, &token).await;
            }
            Ok(ClientCommand::Event { event }) if event == "logout" => self.logout(connection),
            Ok(ClientCommand::Event { event }) => {
                trace!(connection_id = %connection, event = %event, "ignoring client event");
            }
            Err(_) => trace!(connection_id = %connection, "ignoring unparseable client frame"),
        }
    }

    /// Route one packet from the notification channel. Returns how many clients got it.
    pub fn deliver(&self, packet: NotificationPacket) -> usize {
        let (delivery, packet) = packet.into_delivery();
        match delivery {
            Delivery::Broadcast => self.broadcast(&packet),
            Delivery::Direct(token) => usize::from(self.direct(&packet, &token)),
            Delivery::Invalidate(token) => {
                self.invalidate_token(&token);
                0
            }
        }
    }

    /// Send to every admitted session. One failing client does not stop the rest.
    pub fn broadcast(&self, packet: &ClientPacket) -> usize {
        let Some(text) = encode(packet) else {
            return 0;
        };
        let targets: Vec<(SessionId, ConnectionId)> = self
            .sessions
            .lock()
            .valid_sessions()
            .map(|s| (s.id.clone(), s.connection.clone()))
            .collect();

        let mut delivered = 0;
        for (session_id, connection) in targets {
            if !self.connections.contains_key(&connection) {
                self.drop_stale(&session_id);
                continue;
            }
            if self.send(&connection, Outbound::Text(text.clone())) {
                delivered += 1;
            }
        }
        trace!(event = %packet.event, delivered, "broadcast");
        delivered
    }

    /// Send to the newest live session bound to `token`, if any.
    pub fn direct(&self, packet: &ClientPacket, token: &str) -> bool {
        loop {
            let target = self
                .sessions
                .lock()
                .for_token(token)
                .filter(|s| s.is_valid())
                .map(|s| (s.id.clone(), s.connection.clone()));
            let Some((session_id, connection)) = target else {
                trace!(event = %packet.event, "no session for direct packet");
                return false;
            };
            // A stale session is removed, so an older one may hold the token next.
            if !self.connections.contains_key(&connection) {
                self.drop_stale(&session_id);
                continue;
            }
            return match encode(packet) {
                Some(text) => self.send(&connection, Outbound::Text(text)),
                None => false,
            };
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn send(&self, connection: &ConnectionId, message: Outbound) -> bool {
        let Some(tx) = self.connections.get(connection).map(|entry| entry.value().clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %connection, "send queue full, dropping packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(connection_id = %connection, "connection gone, dropping packet");
                false
            }
        }
    }

    fn close(&self, connection: &ConnectionId) {
        if let Some((_, tx)) = self.connections.remove(connection) {
            if tx.try_send(Outbound::Close).is_err() {
                debug!(connection_id = %connection, "close frame not queued");
            }
        }
    }

    fn drop_stale(&self, session_id: &SessionId) {
        if self.sessions.lock().invalidate(session_id).is_some() {
            debug!(session_id = %session_id, "dropped session with no live connection");
        }
    }
}

fn auth_failed_frame() -> String {
    serde_json::json!({"event": "error", "args": {"message": "authentication failed"}}).to_string()
}

fn encode(packet: &ClientPacket) -> Option<String> {
    match serde_json::to_string(packet) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event = %packet.event, error = %e, "failed to encode packet");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::StoreError;
    use serde_json::{json, Value};
    use std::collections::HashSet;

    struct AllowList(HashSet<String>);

    impl SessionStore for AllowList {
        fn is_valid(&self, token: &str) -> std::result::Result<bool, StoreError> {
            Ok(self.0.contains(token))
        }
    }

    struct Unreachable;

    impl SessionStore for Unreachable {
        fn is_valid(&self, _token: &str) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Database("locked".into()))
        }
    }

    fn service_with(tokens: &[&str], max_sessions: usize) -> FanoutService {
        let allowed = tokens.iter().map(|t| t.to_string()).collect();
        FanoutService::new(Arc::new(AllowList(allowed)), max_sessions, 8)
    }

    fn packet(event: &str) -> ClientPacket {
        ClientPacket {
            event: event.into(),
            args: json!({"n": 1}),
            endpoint: "jobs".into(),
        }
    }

    fn text(message: Outbound) -> Value {
        match message {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("expected text, got close"),
        }
    }

    #[tokio::test]
    async fn invalid_token_is_told_and_kept_connected() {
        let service = service_with(&["good"], 10);
        let (conn, mut rx) = service.connect();

        let err = service.authenticate(&conn, "bad").await.unwrap_err();
        assert!(matches!(err, FanoutError::AuthenticationFailed));
        let frame = text(rx.try_recv().unwrap());
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["args"]["message"], "authentication failed");
        assert_eq!(service.connection_count(), 1);
        assert_eq!(service.session_count(), 0);

        // Unadmitted connections get no broadcasts.
        assert_eq!(service.broadcast(&packet("x")), 0);

        service.authenticate(&conn, "good").await.unwrap();
        assert_eq!(service.broadcast(&packet("x")), 1);
    }

    #[tokio::test]
    async fn store_failure_denies_admission() {
        let service = FanoutService::new(Arc::new(Unreachable), 10, 8);
        let (conn, mut rx) = service.connect();
        assert!(service.authenticate(&conn, "any").await.is_err());
        assert_eq!(text(rx.try_recv().unwrap())["event"], "error");
    }

    #[tokio::test]
    async fn unknown_connection_is_rejected() {
        let service = service_with(&["good"], 10);
        let err = service.authenticate(&ConnectionId::new(), "good").await.unwrap_err();
        assert!(matches!(err, FanoutError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn direct_reaches_only_its_token_among_a_thousand() {
        let mut tokens: Vec<String> = (0..1000).map(|i| format!("tok-{i}")).collect();
        tokens.push("target".into());
        let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let service = service_with(&refs, 2000);

        let mut others = Vec::new();
        for token in &tokens[..1000] {
            let (conn, rx) = service.connect();
            service.authenticate(&conn, token).await.unwrap();
            others.push(rx);
        }
        let (conn, mut target_rx) = service.connect();
        service.authenticate(&conn, "target").await.unwrap();
        assert_eq!(service.session_count(), 1001);

        let delivered = service.deliver(NotificationPacket::direct(
            "jobs",
            "status_changed",
            json!({"status": "running"}),
            "target",
        ));
        assert_eq!(delivered, 1);

        let frame = text(target_rx.try_recv().unwrap());
        assert_eq!(frame["event"], "status_changed");
        assert!(frame.get("token_key").is_none());
        for rx in &mut others {
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn shared_token_falls_back_to_the_remaining_tab() {
        let service = service_with(&["T"], 10);
        let (first, mut rx_first) = service.connect();
        let (second, _rx_second) = service.connect();
        service.authenticate(&first, "T").await.unwrap();
        service.authenticate(&second, "T").await.unwrap();

        service.disconnect(&second);
        assert_eq!(service.session_count(), 1);
        let delivered = service.deliver(NotificationPacket::direct("jobs", "x", json!({}), "T"));
        assert_eq!(delivered, 1);
        assert_eq!(text(rx_first.try_recv().unwrap())["event"], "x");
    }

    #[tokio::test]
    async fn stale_newest_session_does_not_hide_an_older_one() {
        let service = service_with(&["T"], 10);
        let (first, mut rx_first) = service.connect();
        let (second, _rx_second) = service.connect();
        service.authenticate(&first, "T").await.unwrap();
        service.authenticate(&second, "T").await.unwrap();

        service.connections.remove(&second);
        assert!(service.direct(&packet("x"), "T"));
        assert_eq!(service.session_count(), 1);
        assert!(rx_first.try_recv().is_ok());
    }

    #[tokio::test]
    async fn invalidate_packet_closes_sessions_without_forwarding() {
        let service = service_with(&["a", "b"], 10);
        let (a, mut rx_a) = service.connect();
        let (b, mut rx_b) = service.connect();
        service.authenticate(&a, "a").await.unwrap();
        service.authenticate(&b, "b").await.unwrap();

        assert_eq!(service.deliver(NotificationPacket::invalidate_sessions("a")), 0);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Close);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn direct_to_absent_token_is_not_an_error() {
        let service = service_with(&["good"], 10);
        assert!(!service.direct(&packet("x"), "nobody"));
    }

    #[tokio::test]
    async fn broadcast_survives_one_failing_client() {
        let service = service_with(&["a", "b", "c"], 10);
        let (a, mut rx_a) = service.connect();
        let (b, rx_b) = service.connect();
        let (c, mut rx_c) = service.connect();
        for (conn, token) in [(&a, "a"), (&b, "b"), (&c, "c")] {
            service.authenticate(conn, token).await.unwrap();
        }
        drop(rx_b);

        let delivered = service.deliver(NotificationPacket::broadcast("jobs", "tick", json!({})));
        assert_eq!(delivered, 2);
        assert_eq!(text(rx_a.try_recv().unwrap())["event"], "tick");
        assert_eq!(text(rx_c.try_recv().unwrap())["event"], "tick");
    }

    #[tokio::test]
    async fn disconnected_sessions_are_pruned_on_delivery() {
        let service = service_with(&["a"], 10);
        let (conn, _rx) = service.connect();
        service.authenticate(&conn, "a").await.unwrap();

        // Connection vanishes without the session being cleaned up.
        service.connections.remove(&conn);
        assert_eq!(service.session_count(), 1);
        assert!(!service.direct(&packet("x"), "a"));
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn logout_invalidates_and_closes() {
        let service = service_with(&["a"], 10);
        let (conn, mut rx) = service.connect();
        service.authenticate(&conn, "a").await.unwrap();

        service.handle_client_text(&conn, r#"{"event":"logout"}"#).await;
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(service.session_count(), 0);
        assert_eq!(service.connection_count(), 0);
    }

    #[tokio::test]
    async fn invalidated_token_forces_disconnect() {
        let service = service_with(&["a", "b"], 10);
        let (a, mut rx_a) = service.connect();
        let (b, mut rx_b) = service.connect();
        service.authenticate(&a, "a").await.unwrap();
        service.authenticate(&b, "b").await.unwrap();

        assert_eq!(service.invalidate_token("a"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Close);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(service.broadcast(&packet("x")), 1);
    }

    #[tokio::test]
    async fn token_frame_retries_admission() {
        let service = service_with(&["good"], 10);
        let (conn, mut rx) = service.connect();
        service.handle_client_text(&conn, r#"{"token":"bad"}"#).await;
        assert_eq!(text(rx.try_recv().unwrap())["event"], "error");

        service.handle_client_text(&conn, r#"{"token":"good"}"#).await;
        assert_eq!(service.session_count(), 1);

        service.handle_client_text(&conn, "not json").await;
        service.handle_client_text(&conn, r#"{"event":"subscribe"}"#).await;
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn logout_with_a_token_field_is_still_a_logout() {
        let service = service_with(&["a"], 10);
        let (conn, mut rx) = service.connect();
        service.authenticate(&conn, "a").await.unwrap();

        service.handle_client_text(&conn, r#"{"event":"logout","token":"a"}"#).await;
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn capacity_prunes_oldest_session() {
        let service = service_with(&["a", "b"], 1);
        let (a, mut rx_a) = service.connect();
        let (b, mut rx_b) = service.connect();
        service.authenticate(&a, "a").await.unwrap();
        service.authenticate(&b, "b").await.unwrap();

        assert_eq!(service.session_count(), 1);
        assert_eq!(service.broadcast(&packet("x")), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
