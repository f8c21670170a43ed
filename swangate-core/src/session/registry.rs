//! Session registry - the process-wide table of live sessions.
//!
//! The registry:
//! - Opens a connection and assigns it a slot on connect
//! - Authenticates (id, token) pairs and renews the session lease
//! - Tears sessions down on lease expiry, disconnect, or shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::engine::{ConnectOptions, ConnectParams, PgConnection};
use crate::error::ServerError;
use crate::session::id::{SessionId, SessionToken};
use crate::session::lease::LeaseStatus;
use crate::session::slots::{SlotTable, CAPACITY};
use crate::session::{Session, SessionConnection};

/// Registry for managing all active sessions
pub struct SessionRegistry<C = PgConnection> {
    inner: Arc<RegistryInner<C>>,
}

impl<C> Clone for SessionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionRegistrySnapshot {
    pub live_sessions: usize,
    pub capacity: usize,
    pub open_transactions: usize,
    pub session_lease_seconds: u64,
    pub session_renewal_seconds: u64,
    pub sessions_opened: u64,
    pub sessions_expired: u64,
    pub sessions_disconnected: u64,
}

struct RegistryInner<C> {
    slots: SlotTable<Session<C>>,
    connect_options: ConnectOptions,
    lease_window: Duration,
    renewal_window: Duration,
    transaction_capacity: usize,
    opened: AtomicU64,
    expired: AtomicU64,
    disconnected: AtomicU64,
}

impl SessionRegistry {
    /// Create a new session registry
    #[instrument(skip(config))]
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        Self::with_capacity(config, CAPACITY)
    }

    /// Registry whose session and transaction tables hold `capacity` slots each.
    pub fn with_capacity(config: &ServerConfig, capacity: usize) -> Result<Self, ServerError> {
        Self::build(config, capacity)
    }

    /// Open a database connection for the caller and register a session for it.
    #[instrument(skip(self, params), fields(host = %params.host, user = %params.user))]
    pub async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<(SessionId, SessionToken), ServerError> {
        let connection = PgConnection::connect(params, &self.inner.connect_options).await?;
        self.register(connection)
    }
}

impl<C: SessionConnection> SessionRegistry<C> {
    pub(crate) fn build(config: &ServerConfig, capacity: usize) -> Result<Self, ServerError> {
        if capacity == 0 {
            return Err(ServerError::Internal(
                "session registry capacity must be greater than zero".to_string(),
            ));
        }
        let ssl_mode = config
            .ssl_mode()
            .map_err(|err| ServerError::Internal(err.to_string()))?;
        let connect_options = ConnectOptions {
            ssl_mode,
            connect_timeout: config.connect_timeout(),
        };

        info!(
            capacity,
            session_lease_seconds = config.session_lease_seconds,
            session_renewal_seconds = config.session_renewal_seconds,
            ssl_mode = ?ssl_mode,
            "session registry initialized"
        );

        Ok(Self {
            inner: Arc::new(RegistryInner {
                slots: SlotTable::new(capacity),
                connect_options,
                lease_window: config.session_lease(),
                renewal_window: config.session_renewal(),
                transaction_capacity: capacity,
                opened: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                disconnected: AtomicU64::new(0),
            }),
        })
    }

    /// Give an open connection a slot, a token, and a running lease.
    ///
    /// With no free slot the connection is dropped and `CapacityExhausted`
    /// is returned.
    pub fn register(&self, connection: C) -> Result<(SessionId, SessionToken), ServerError> {
        let token = SessionToken::generate();
        let inner = &self.inner;
        let session = inner
            .slots
            .insert_with(|id| {
                Arc::new(Session::new(
                    SessionId::new(id),
                    token.clone(),
                    connection,
                    inner.lease_window,
                    inner.transaction_capacity,
                ))
            })
            .map_err(|_unused| {
                warn!(
                    live_sessions = inner.slots.len(),
                    "no free session slot; closing new connection"
                );
                ServerError::CapacityExhausted("session")
            })?;

        let watcher = tokio::spawn(watch_lease(
            Arc::downgrade(&self.inner),
            Arc::downgrade(&session),
        ));
        session.lease().attach_watcher(watcher);
        inner.opened.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %session.id(),
            live_sessions = inner.slots.len(),
            "session opened"
        );
        Ok((session.id(), token))
    }

    /// Resolve `(token, connection_id)` to its session and renew the lease.
    ///
    /// Every failure (empty slot, reused slot, wrong token, fired lease) is the
    /// same `Unauthorized`.
    pub fn authenticate(
        &self,
        token: &str,
        connection_id: u32,
    ) -> Result<Arc<Session<C>>, ServerError> {
        let id = SessionId::new(connection_id);
        let renewal = self.inner.renewal_window;
        let session = self.inner.slots.with_slot(id.slot(self.inner.slots.capacity()), |slot| {
            let session = slot?;
            if session.id() != id || !session.token().matches(token) {
                return None;
            }
            if !session.lease().renew(renewal) {
                return None;
            }
            Some(Arc::clone(session))
        });
        session.ok_or_else(|| {
            debug!(connection_id, "authentication failed");
            ServerError::Unauthorized
        })
    }

    /// Authenticate, then destroy the session the same way expiry does.
    #[instrument(skip(self, token))]
    pub fn disconnect(&self, token: &str, connection_id: u32) -> Result<(), ServerError> {
        let session = self.authenticate(token, connection_id)?;
        self.inner.remove(&session);
        session.close();
        self.inner.disconnected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn snapshot(&self) -> SessionRegistrySnapshot {
        let inner = &self.inner;
        let open_transactions = inner
            .slots
            .values()
            .iter()
            .map(|session| session.transactions().open_count())
            .sum();

        SessionRegistrySnapshot {
            live_sessions: inner.slots.len(),
            capacity: inner.slots.capacity(),
            open_transactions,
            session_lease_seconds: inner.lease_window.as_secs(),
            session_renewal_seconds: inner.renewal_window.as_secs(),
            sessions_opened: inner.opened.load(Ordering::Relaxed),
            sessions_expired: inner.expired.load(Ordering::Relaxed),
            sessions_disconnected: inner.disconnected.load(Ordering::Relaxed),
        }
    }

    /// Close every live session. Returns how many were closed.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> usize {
        let sessions = self.inner.slots.drain();
        for session in &sessions {
            session.close();
        }
        info!(closed = sessions.len(), "session registry shut down");
        sessions.len()
    }
}

impl<C: SessionConnection> RegistryInner<C> {
    /// Clear the session's slot if it still holds this exact session.
    fn remove(&self, session: &Arc<Session<C>>) -> bool {
        let index = session.id().slot(self.slots.capacity());
        if self.slots.clear_if(index, session) {
            return true;
        }
        if self.slots.with_slot(index, |slot| slot.is_some()) {
            let err = ServerError::Protocol(format!(
                "slot for connection {} holds a different session",
                session.id()
            ));
            warn!(error = %err, "leaving foreign session in place");
        }
        false
    }

    fn expire(&self, session: &Arc<Session<C>>) {
        if self.remove(session) {
            self.expired.fetch_add(1, Ordering::Relaxed);
            info!(connection_id = %session.id(), "session lease expired");
        }
        session.close();
    }
}

/// Sleep until the session's lease deadline, following renewals, and expire
/// the session once the deadline passes unrenewed.
async fn watch_lease<C: SessionConnection>(
    registry: Weak<RegistryInner<C>>,
    session: Weak<Session<C>>,
) {
    loop {
        let status = match session.upgrade() {
            Some(session) => session.lease().poll(Instant::now()),
            None => return,
        };
        match status {
            LeaseStatus::Active(deadline) => tokio::time::sleep_until(deadline).await,
            LeaseStatus::Expired => break,
        }
    }

    if let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) {
        registry.expire(&session);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use anyhow::{anyhow, Result};

    use super::*;

    fn build_registry(capacity: usize) -> Result<SessionRegistry> {
        SessionRegistry::with_capacity(&ServerConfig::default(), capacity)
            .map_err(|e| anyhow!(e.to_string()))
    }

    #[test]
    fn snapshot_for_empty_registry_reports_configuration() -> Result<()> {
        let registry = build_registry(16)?;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live_sessions, 0);
        assert_eq!(snapshot.capacity, 16);
        assert_eq!(snapshot.open_transactions, 0);
        assert_eq!(snapshot.session_lease_seconds, 3600);
        assert_eq!(snapshot.session_renewal_seconds, 120);
        assert_eq!(snapshot.sessions_opened, 0);
        Ok(())
    }

    #[test]
    fn default_registry_uses_full_capacity() -> Result<()> {
        let registry =
            SessionRegistry::new(&ServerConfig::default()).map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(registry.snapshot().capacity, 65_536);
        Ok(())
    }

    #[test]
    fn unknown_session_is_unauthorized() -> Result<()> {
        let registry = build_registry(16)?;
        for connection_id in [0, 1, 17, u32::MAX] {
            assert!(matches!(
                registry.authenticate("anything", connection_id),
                Err(ServerError::Unauthorized)
            ));
            assert!(matches!(
                registry.disconnect("anything", connection_id),
                Err(ServerError::Unauthorized)
            ));
        }
        Ok(())
    }

    #[test]
    fn invalid_ssl_mode_is_rejected() {
        let config = ServerConfig {
            database_ssl_mode: "bogus".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            SessionRegistry::new(&config),
            Err(ServerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_session_behind() -> Result<()> {
        let config = ServerConfig {
            connect_timeout_seconds: 2,
            ..ServerConfig::default()
        };
        let registry = SessionRegistry::with_capacity(&config, 16)
            .map_err(|e| anyhow!(e.to_string()))?;
        let params = ConnectParams {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "nobody".to_string(),
            password: None,
            dbname: None,
        };

        let err = registry
            .connect(&params)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected connect to an unused port to fail"))?;
        assert!(matches!(err, ServerError::Postgres(_)));
        assert_eq!(registry.snapshot().live_sessions, 0);
        assert_eq!(registry.snapshot().sessions_opened, 0);
        Ok(())
    }

    #[test]
    fn shutdown_of_empty_registry_is_a_no_op() -> Result<()> {
        let registry = build_registry(4)?;
        assert_eq!(registry.shutdown(), 0);
        assert_eq!(registry.snapshot().live_sessions, 0);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            SessionRegistry::with_capacity(&ServerConfig::default(), 0),
            Err(ServerError::Internal(_))
        ));
    }

    /// Connection stand-in that records when the registry closes it.
    #[derive(Default)]
    struct FakeConnection {
        closed: Arc<AtomicBool>,
    }

    impl SessionConnection for FakeConnection {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn fake_registry(
        capacity: usize,
        lease_seconds: u64,
        renewal_seconds: u64,
    ) -> Result<SessionRegistry<FakeConnection>> {
        let config = ServerConfig {
            session_lease_seconds: lease_seconds,
            session_renewal_seconds: renewal_seconds,
            ..ServerConfig::default()
        };
        SessionRegistry::build(&config, capacity).map_err(|e| anyhow!(e.to_string()))
    }

    fn register(
        registry: &SessionRegistry<FakeConnection>,
    ) -> Result<(SessionId, SessionToken, Arc<AtomicBool>)> {
        let connection = FakeConnection::default();
        let closed = Arc::clone(&connection.closed);
        let (id, token) = registry
            .register(connection)
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok((id, token, closed))
    }

    /// Let the lease watchers observe the current (paused) clock.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn flip_last_byte(token: &SessionToken) -> String {
        let mut bytes = token.as_str().as_bytes().to_vec();
        if let Some(last) = bytes.last_mut() {
            *last = if *last == b'0' { b'1' } else { b'0' };
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn token_off_by_one_byte_is_rejected_for_a_live_session() -> Result<()> {
        let registry = fake_registry(16, 60, 30)?;
        let (id, token, _) = register(&registry)?;

        assert!(matches!(
            registry.authenticate(&flip_last_byte(&token), id.id()),
            Err(ServerError::Unauthorized)
        ));
        let truncated = &token.as_str()[..token.as_str().len() - 1];
        assert!(matches!(
            registry.authenticate(truncated, id.id()),
            Err(ServerError::Unauthorized)
        ));
        assert!(matches!(
            registry.authenticate(token.as_str(), id.id() + 16),
            Err(ServerError::Unauthorized)
        ));

        let session = registry
            .authenticate(token.as_str(), id.id())
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(session.id(), id);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires_and_is_closed() -> Result<()> {
        let registry = fake_registry(16, 10, 5)?;
        let (id, token, closed) = register(&registry)?;
        assert_eq!(registry.snapshot().live_sessions, 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert!(!closed.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(
            registry.authenticate(token.as_str(), id.id()),
            Err(ServerError::Unauthorized)
        ));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live_sessions, 0);
        assert_eq!(snapshot.sessions_expired, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_renews_the_lease() -> Result<()> {
        let registry = fake_registry(16, 10, 5)?;
        let (id, token, closed) = register(&registry)?;

        // Renewed at 8s and 12s; each renewal moves the deadline 5s out.
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(4)).await;
            settle().await;
        }
        registry
            .authenticate(token.as_str(), id.id())
            .map_err(|e| anyhow!(e.to_string()))?;
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        registry
            .authenticate(token.as_str(), id.id())
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(!closed.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(
            registry.authenticate(token.as_str(), id.id()),
            Err(ServerError::Unauthorized)
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pair_stays_rejected_after_its_id_is_reissued() -> Result<()> {
        let registry = fake_registry(4, 10, 5)?;
        let (old_id, old_token, _) = register(&registry)?;
        assert_eq!(old_id.id(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(registry.snapshot().live_sessions, 0);

        // Run the id counter through its u32 wrap so id 1 comes round again.
        registry.inner.slots.restart_ids_after(u32::MAX);
        let (new_id, new_token, _) = register(&registry)?;
        assert_eq!(new_id, old_id);

        assert!(matches!(
            registry.authenticate(old_token.as_str(), old_id.id()),
            Err(ServerError::Unauthorized)
        ));
        let session = registry
            .authenticate(new_token.as_str(), new_id.id())
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(session.token().matches(new_token.as_str()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_connection_and_frees_the_slot() -> Result<()> {
        let registry = fake_registry(16, 60, 30)?;
        let (id, token, closed) = register(&registry)?;

        assert!(matches!(
            registry.disconnect(&flip_last_byte(&token), id.id()),
            Err(ServerError::Unauthorized)
        ));
        assert!(!closed.load(Ordering::SeqCst));

        registry
            .disconnect(token.as_str(), id.id())
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(closed.load(Ordering::SeqCst));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.live_sessions, 0);
        assert_eq!(snapshot.sessions_disconnected, 1);

        // The lease watcher was cancelled, so nothing is counted as expired later.
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(registry.snapshot().sessions_expired, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn full_registry_refuses_new_sessions() -> Result<()> {
        let registry = fake_registry(2, 60, 30)?;
        register(&registry)?;
        register(&registry)?;

        assert!(matches!(
            registry.register(FakeConnection::default()),
            Err(ServerError::CapacityExhausted("session"))
        ));
        assert_eq!(registry.snapshot().live_sessions, 2);
        assert_eq!(registry.shutdown(), 2);
        Ok(())
    }
}
