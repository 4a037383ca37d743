// Per-shard authenticated sessions: lazy creation, cross-shard authorization, shared reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{BackendError, GatewayError, GatewayResult};
use crate::source::location::ObjectLocation;
use crate::source::traits::{
    BackendTransport, Credentials, ExportedAuthorization, ShardId, ShardLink,
};

/// An authorized connection to one shard, shared by every stream targeting it.
pub struct ShardSession {
    shard: ShardId,
    link: Arc<dyn ShardLink>,
    credentials: Credentials,
}

impl ShardSession {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Links multiplex, so fetches from different streams interleave freely.
    pub async fn fetch_chunk(
        &self,
        location: &ObjectLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError> {
        self.link.fetch_chunk(location, offset, limit).await
    }
}

#[derive(Debug)]
enum HandshakeFailure {
    /// Every import attempt was rejected as invalid.
    Exhausted { attempts: u32 },
    Backend(BackendError),
}

#[derive(Debug)]
enum HandshakeState {
    Unauthenticated,
    Exporting { attempt: u32 },
    Importing { attempt: u32, auth: ExportedAuthorization },
    Authenticated { attempts: u32 },
    Failed(HandshakeFailure),
}

/// Export/import exchange that authorizes a fresh link on a foreign shard.
struct Handshake<'a> {
    transport: &'a dyn BackendTransport,
    link: &'a dyn ShardLink,
    shard: ShardId,
    max_attempts: u32,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    fn new(
        transport: &'a dyn BackendTransport,
        link: &'a dyn ShardLink,
        shard: ShardId,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            link,
            shard,
            max_attempts,
            state: HandshakeState::Unauthenticated,
        }
    }

    /// Drive the exchange to a terminal state. Returns the attempts used.
    async fn run(mut self) -> Result<u32, HandshakeFailure> {
        loop {
            let state = std::mem::replace(&mut self.state, HandshakeState::Unauthenticated);
            self.state = match state {
                HandshakeState::Unauthenticated => HandshakeState::Exporting { attempt: 1 },
                HandshakeState::Exporting { attempt } => {
                    match self.transport.export_authorization(self.shard).await {
                        Ok(auth) => HandshakeState::Importing { attempt, auth },
                        Err(e) => HandshakeState::Failed(HandshakeFailure::Backend(e)),
                    }
                }
                HandshakeState::Importing { attempt, auth } => {
                    match self.link.import_authorization(&auth).await {
                        Ok(()) => HandshakeState::Authenticated { attempts: attempt },
                        Err(BackendError::AuthKeyInvalid) if attempt < self.max_attempts => {
                            debug!(
                                "invalid auth bytes for shard {} (attempt {}), retrying",
                                self.shard, attempt
                            );
                            HandshakeState::Exporting {
                                attempt: attempt + 1,
                            }
                        }
                        Err(BackendError::AuthKeyInvalid) => {
                            HandshakeState::Failed(HandshakeFailure::Exhausted { attempts: attempt })
                        }
                        Err(e) => HandshakeState::Failed(HandshakeFailure::Backend(e)),
                    }
                }
                HandshakeState::Authenticated { attempts } => return Ok(attempts),
                HandshakeState::Failed(failure) => return Err(failure),
            };
        }
    }
}

/// Why the last creation attempt for a shard failed, shareable with every
/// caller that queued behind it.
#[derive(Debug, Clone)]
enum CreationFailure {
    Auth { attempts: u32 },
    Backend(BackendError),
}

impl CreationFailure {
    fn into_error(self, shard: ShardId) -> GatewayError {
        match self {
            Self::Auth { attempts } => GatewayError::AuthFailure { shard, attempts },
            Self::Backend(e) => GatewayError::Backend(e),
        }
    }
}

impl From<BackendError> for CreationFailure {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

#[derive(Default)]
struct SlotState {
    session: Option<Arc<ShardSession>>,
    last_failure: Option<CreationFailure>,
}

impl SlotState {
    /// Outcome a caller can take without starting its own creation attempt.
    fn settled(&self, attempt_finished: bool) -> Option<Result<Arc<ShardSession>, CreationFailure>> {
        if let Some(session) = &self.session {
            return Some(Ok(Arc::clone(session)));
        }
        if attempt_finished {
            return self.last_failure.clone().map(Err);
        }
        None
    }
}

#[derive(Default)]
struct ShardSlot {
    /// Creation attempts completed so far. Only bumped with `state` locked.
    finished: AtomicU64,
    state: tokio::sync::Mutex<SlotState>,
}

type Slot = Arc<ShardSlot>;

pub struct ShardSessionManager {
    transport: Arc<dyn BackendTransport>,
    slots: Mutex<HashMap<ShardId, Slot>>,
    import_attempts: u32,
    handshakes: Arc<AtomicUsize>,
}

impl ShardSessionManager {
    pub fn new(transport: Arc<dyn BackendTransport>, import_attempts: u32) -> Self {
        Self {
            transport,
            slots: Mutex::new(HashMap::new()),
            import_attempts: import_attempts.max(1),
            handshakes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slot(&self, shard: ShardId) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(shard).or_default())
    }

    /// Return the session for `shard`, creating and authorizing it on first use.
    ///
    /// Creation holds a lock scoped to the shard. Callers that queued on it
    /// while an attempt ran take that attempt's outcome, failure included, so
    /// a burst of requests costs one handshake. Creation runs on its own task:
    /// a caller that goes away mid-handshake does not strand a half-built
    /// session.
    pub async fn session_for(&self, shard: ShardId) -> GatewayResult<Arc<ShardSession>> {
        let slot = self.slot(shard);
        let seen = slot.finished.load(Ordering::SeqCst);

        let settled = {
            let state = slot.state.lock().await;
            state.settled(slot.finished.load(Ordering::SeqCst) != seen)
        };
        if let Some(outcome) = settled {
            if outcome.is_ok() {
                debug!("reusing session for shard {}", shard);
            }
            return outcome.map_err(|f| f.into_error(shard));
        }

        let transport = Arc::clone(&self.transport);
        let attempts = self.import_attempts;
        let handshakes = Arc::clone(&self.handshakes);
        let task = tokio::spawn(async move {
            let mut state = slot.state.lock().await;
            if let Some(outcome) = state.settled(slot.finished.load(Ordering::SeqCst) != seen) {
                return outcome;
            }

            let outcome = establish(transport.as_ref(), shard, attempts, &handshakes).await;
            match &outcome {
                Ok(session) => {
                    state.session = Some(Arc::clone(session));
                    state.last_failure = None;
                }
                Err(failure) => state.last_failure = Some(failure.clone()),
            }
            slot.finished.fetch_add(1, Ordering::SeqCst);
            outcome
        });

        match task.await {
            Ok(outcome) => outcome.map_err(|f| f.into_error(shard)),
            Err(e) => {
                error!("session task for shard {} failed: {}", shard, e);
                Err(GatewayError::Backend(BackendError::Transport(format!(
                    "session task failed: {}",
                    e
                ))))
            }
        }
    }

    /// Tear down `stale` if it is still the live session for its shard.
    pub async fn invalidate(&self, stale: &Arc<ShardSession>) {
        let slot = self.slots.lock().get(&stale.shard).cloned();
        let Some(slot) = slot else {
            return;
        };
        let removed = {
            let mut state = slot.state.lock().await;
            match state.session.as_ref() {
                Some(current) if Arc::ptr_eq(current, stale) => state.session.take(),
                _ => None,
            }
        };
        if let Some(session) = removed {
            warn!("tearing down session for shard {}", session.shard);
            session.link.close().await;
        }
    }

    /// Whether a live session exists for `shard`.
    pub async fn is_established(&self, shard: ShardId) -> bool {
        let slot = self.slots.lock().get(&shard).cloned();
        match slot {
            Some(slot) => slot.state.lock().await.session.is_some(),
            None => false,
        }
    }

    /// Number of foreign-shard handshakes started since construction.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let session = slot.state.lock().await.session.take();
            if let Some(session) = session {
                debug!("closing session for shard {}", session.shard);
                session.link.close().await;
            }
        }
    }
}

async fn establish(
    transport: &dyn BackendTransport,
    shard: ShardId,
    max_attempts: u32,
    handshakes: &AtomicUsize,
) -> Result<Arc<ShardSession>, CreationFailure> {
    if shard == transport.home_shard() {
        let link = transport.connect(shard, Credentials::Home).await?;
        info!("created session for home shard {}", shard);
        return Ok(Arc::new(ShardSession {
            shard,
            link,
            credentials: Credentials::Home,
        }));
    }

    let link = transport.connect(shard, Credentials::Fresh).await?;
    handshakes.fetch_add(1, Ordering::SeqCst);
    match Handshake::new(transport, link.as_ref(), shard, max_attempts)
        .run()
        .await
    {
        Ok(attempts) => {
            info!("created session for shard {} after {} attempt(s)", shard, attempts);
            Ok(Arc::new(ShardSession {
                shard,
                link,
                credentials: Credentials::Fresh,
            }))
        }
        Err(HandshakeFailure::Exhausted { attempts }) => {
            link.close().await;
            error!(
                "authorization for shard {} rejected {} times; shard unavailable",
                shard, attempts
            );
            Err(CreationFailure::Auth { attempts })
        }
        Err(HandshakeFailure::Backend(e)) => {
            link.close().await;
            error!("authorization exchange with shard {} failed: {}", shard, e);
            Err(CreationFailure::Backend(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;

    /// Backend whose foreign-shard imports are rejected a set number of times.
    struct Rejecting {
        rejections: AtomicU32,
        exports: AtomicUsize,
    }

    impl Rejecting {
        fn new(rejections: u32) -> Self {
            Self {
                rejections: AtomicU32::new(rejections),
                exports: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendTransport for Rejecting {
        fn home_shard(&self) -> ShardId {
            2
        }

        async fn connect(
            &self,
            _shard: ShardId,
            _credentials: Credentials,
        ) -> Result<Arc<dyn ShardLink>, BackendError> {
            unreachable!("handshake tests build their own link")
        }

        async fn export_authorization(
            &self,
            _target: ShardId,
        ) -> Result<ExportedAuthorization, BackendError> {
            let id = self.exports.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(ExportedAuthorization {
                id,
                bytes: Bytes::from_static(b"auth"),
            })
        }
    }

    #[async_trait]
    impl ShardLink for Rejecting {
        async fn import_authorization(
            &self,
            _auth: &ExportedAuthorization,
        ) -> Result<(), BackendError> {
            let rejected = self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                Err(BackendError::AuthKeyInvalid)
            } else {
                Ok(())
            }
        }

        async fn fetch_chunk(
            &self,
            _location: &ObjectLocation,
            _offset: u64,
            _limit: u64,
        ) -> Result<Bytes, BackendError> {
            Ok(Bytes::new())
        }
    }

    #[tokio::test]
    async fn test_handshake_retries_then_succeeds() {
        let backend = Rejecting::new(2);
        let attempts = Handshake::new(&backend, &backend, 4, 6).run().await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(backend.exports.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handshake_gives_up_at_bound() {
        let backend = Rejecting::new(u32::MAX);
        let failure = Handshake::new(&backend, &backend, 4, 6).run().await.unwrap_err();
        assert!(matches!(failure, HandshakeFailure::Exhausted { attempts: 6 }));
        assert_eq!(backend.exports.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_failed_attempt_is_shared_only_with_waiters() {
        let state = SlotState {
            session: None,
            last_failure: Some(CreationFailure::Auth { attempts: 6 }),
        };
        assert!(matches!(
            state.settled(true),
            Some(Err(CreationFailure::Auth { attempts: 6 }))
        ));
        assert!(state.settled(false).is_none());
    }
}
