//! Device connection lifecycle
//!
//! Each link is driven by its own task. Protocol events go through the pure
//! [`transition`] function and the resulting [`Action`]s are applied against
//! the registry, the session store and the router. `connect` waits on a
//! oneshot that the task resolves with the first pairing code, a successful
//! open, or a terminal failure.

use common::phone;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;
use crate::models::{ConnectOutcome, DeviceConfig, ReconnectSummary};
use crate::pairing;
use crate::protocol::{
    Credentials, DisconnectReason, InboundMessage, ProtocolConnector, ProtocolEvent,
    ProtocolHandle,
};
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::router::MessageRouter;
use crate::session_store::{SessionHandle, SessionStore};

type OutcomeSender = oneshot::Sender<Result<ConnectOutcome, DeviceError>>;
type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    AwaitingPairing,
    Connected,
    Disconnected,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// First pairing code of the attempt
    EmitPairing(String),
    /// Later pairing codes only refresh the stored one
    RefreshPairing(String),
    PersistCredentials(Credentials),
    MarkConnected,
    RejectIdentity { connected_number: String },
    MarkDisconnected,
    PurgeSession,
    ScheduleReconnect,
    Route(InboundMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ConnectionState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn stay(state: ConnectionState) -> Self {
        Self {
            next: state,
            actions: Vec::new(),
        }
    }

    fn to(next: ConnectionState, actions: Vec<Action>) -> Self {
        Self { next, actions }
    }
}

/// Compute the next state and actions for a protocol event
pub fn transition(
    state: ConnectionState,
    event: ProtocolEvent,
    expected_number: &str,
    country_code: &str,
) -> Transition {
    use ConnectionState::*;

    match (state, event) {
        (_, ProtocolEvent::Connecting) => Transition::stay(state),

        (Connected, ProtocolEvent::Qr { .. }) => Transition::stay(state),
        (AwaitingPairing, ProtocolEvent::Qr { code }) => {
            Transition::to(AwaitingPairing, vec![Action::RefreshPairing(code)])
        }
        (Initializing | Disconnected, ProtocolEvent::Qr { code }) => {
            Transition::to(AwaitingPairing, vec![Action::EmitPairing(code)])
        }

        (_, ProtocolEvent::CredsUpdate { credentials }) => {
            Transition::to(state, vec![Action::PersistCredentials(credentials)])
        }

        (Connected, ProtocolEvent::Open { .. }) => Transition::stay(state),
        (_, ProtocolEvent::Open { jid }) => {
            let connected = phone::number_from_jid(&jid);
            if phone::same_number(connected, expected_number, country_code) {
                Transition::to(Connected, vec![Action::MarkConnected])
            } else {
                Transition::to(
                    Disconnected,
                    vec![Action::RejectIdentity {
                        connected_number: phone::normalize(connected, country_code),
                    }],
                )
            }
        }

        (Disconnected, ProtocolEvent::Close { .. }) => Transition::stay(state),
        (_, ProtocolEvent::Close { reason }) if reason.is_logout() => Transition::to(
            Disconnected,
            vec![Action::MarkDisconnected, Action::PurgeSession],
        ),
        (_, ProtocolEvent::Close { .. }) => Transition::to(
            Disconnected,
            vec![Action::MarkDisconnected, Action::ScheduleReconnect],
        ),

        (Connected, ProtocolEvent::Message { message }) => {
            Transition::to(Connected, vec![Action::Route(message)])
        }
        (_, ProtocolEvent::Message { .. }) => Transition::stay(state),
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub pairing_timeout: Duration,
    pub country_code: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(20),
            country_code: "55".to_string(),
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// State owned by one link's event loop
struct LinkContext {
    config: DeviceConfig,
    session: SessionHandle,
    handle: Arc<dyn ProtocolHandle>,
    generation: u64,
    outcome: Option<OutcomeSender>,
}

impl LinkContext {
    fn resolve(&mut self, result: Result<ConnectOutcome, DeviceError>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(result);
        }
    }
}

struct ManagerInner {
    store: SessionStore,
    registry: DeviceRegistry,
    connector: Arc<dyn ProtocolConnector>,
    router: MessageRouter,
    settings: LifecycleSettings,
}

/// Owns every device connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        store: SessionStore,
        registry: DeviceRegistry,
        connector: Arc<dyn ProtocolConnector>,
        router: MessageRouter,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                connector,
                router,
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Connect a device, returning a pairing code or `Connected`
    ///
    /// `force_new` discards any stored session first. Without it, stored
    /// credentials are used to resume silently.
    pub async fn connect(
        &self,
        config: DeviceConfig,
        force_new: bool,
    ) -> Result<ConnectOutcome, DeviceError> {
        let config = config.normalized(&self.inner.settings.country_code)?;
        let device_id = config.id.clone();

        let (tx, rx) = oneshot::channel();
        let mut outcome = Some(tx);
        self.start(config, force_new, &mut outcome).await?;

        match tokio::time::timeout(self.inner.settings.pairing_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::ConnectionClosed),
            Err(_) => {
                warn!(device_id = %device_id, "Timed out waiting for pairing code");
                self.abandon(&device_id).await;
                Err(DeviceError::PairingTimeout)
            }
        }
    }

    /// Log a device out and delete its session
    pub async fn disconnect(&self, device_id: &str) -> Result<(), DeviceError> {
        let entry = self.inner.registry.remove(device_id).await;

        let number = match &entry {
            Some(entry) => entry.config.phone_number.clone(),
            None => device_id.strip_prefix("device-").unwrap_or_default().to_string(),
        };
        if number.is_empty() || phone::digits_only(&number) != number {
            return Err(DeviceError::NotFound(device_id.to_string()));
        }

        let session = self.inner.store.session_for(&number);
        if entry.is_none() && !self.inner.store.exists(&session).await {
            return Err(DeviceError::NotFound(device_id.to_string()));
        }

        if let Some(handle) = entry.and_then(|entry| entry.handle) {
            if let Err(e) = handle.logout().await {
                warn!(device_id = %device_id, error = %e, "Logout failed, closing anyway");
            }
            handle.shutdown().await;
        }

        self.inner.store.delete(&session).await?;
        info!(device_id = %device_id, "Device disconnected");
        Ok(())
    }

    /// Resume every persisted session, counting outcomes
    pub async fn reconnect_all(&self) -> Result<ReconnectSummary, DeviceError> {
        let sessions = self.inner.store.list_sessions().await?;
        let mut summary = ReconnectSummary {
            total: sessions.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for session in sessions {
            let config = match self.inner.store.validate(&session).await {
                Ok(config) => config,
                Err(e) => {
                    error!(session = %session.name(), error = %e, "Skipping invalid session");
                    summary.failed += 1;
                    continue;
                }
            };

            let manager = self.clone();
            tasks.spawn(async move {
                let device_id = config.id.clone();
                (device_id, manager.connect(config, false).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ConnectOutcome::Connected))) => summary.resumed += 1,
                Ok((device_id, Ok(ConnectOutcome::Pairing(_)))) => {
                    warn!(device_id = %device_id, "Stored session requires pairing again");
                    summary.needs_pairing += 1;
                }
                Ok((device_id, Err(e))) => {
                    error!(device_id = %device_id, error = %e, "Failed to resume session");
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Resume task failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            total = summary.total,
            resumed = summary.resumed,
            needs_pairing = summary.needs_pairing,
            failed = summary.failed,
            "Session rehydration finished"
        );
        Ok(summary)
    }

    /// Open a link and hand it to a fresh event loop
    ///
    /// `outcome` is only taken once the link is open.
    async fn start(
        &self,
        mut config: DeviceConfig,
        force_new: bool,
        outcome: &mut Option<OutcomeSender>,
    ) -> Result<(), DeviceError> {
        let session = self.inner.store.prepare(&config, force_new).await?;
        config.auth_path = Some(session.dir.to_string_lossy().into_owned());

        let credentials = self.inner.store.load_credentials(&session).await?;
        let link = self.inner.connector.open(&config, credentials).await?;

        let generation = self.inner.registry.next_generation();
        let previous = self
            .inner
            .registry
            .register(DeviceEntry::new(config.clone(), link.handle.clone(), generation))
            .await;
        if let Some(handle) = previous.and_then(|entry| entry.handle) {
            info!(device_id = %config.id, "Closing previous connection");
            handle.shutdown().await;
        }

        let context = LinkContext {
            config,
            session,
            handle: link.handle,
            generation,
            outcome: outcome.take(),
        };
        tokio::spawn(self.clone().drive(context, link.events));
        Ok(())
    }

    async fn drive(self, mut ctx: LinkContext, mut events: mpsc::Receiver<ProtocolEvent>) {
        let device_id = ctx.config.id.clone();
        let mut state = ConnectionState::Initializing;

        loop {
            // A stream that ends without a close event counts as a dropped link
            let event = match events.recv().await {
                Some(event) => event,
                None if state == ConnectionState::Disconnected => return,
                None => ProtocolEvent::Close {
                    reason: DisconnectReason::ConnectionLost,
                },
            };

            if !self.inner.registry.is_current(&device_id, ctx.generation).await {
                debug!(device_id = %device_id, "Connection superseded, stopping event loop");
                return;
            }

            let Transition { next, actions } = transition(
                state,
                event,
                &ctx.config.phone_number,
                &self.inner.settings.country_code,
            );
            if next != state {
                info!(device_id = %device_id, from = ?state, to = ?next, "Connection state changed");
            }
            state = next;

            for action in actions {
                if let Flow::Stop = self.apply(&mut ctx, action).await {
                    return;
                }
            }
        }
    }

    async fn apply(&self, ctx: &mut LinkContext, action: Action) -> Flow {
        let registry = &self.inner.registry;
        let device_id = ctx.config.id.clone();

        match action {
            Action::EmitPairing(code) => {
                match pairing::render(&code) {
                    Ok(payload) => {
                        registry
                            .update(&device_id, ctx.generation, |entry| {
                                entry.pending_pairing = Some(code)
                            })
                            .await;
                        info!(device_id = %device_id, "Pairing code ready");
                        ctx.resolve(Ok(ConnectOutcome::Pairing(payload)));
                    }
                    Err(e) => {
                        error!(device_id = %device_id, error = %e, "Failed to render pairing code");
                        ctx.resolve(Err(e));
                    }
                }
                Flow::Continue
            }

            Action::RefreshPairing(code) => {
                registry
                    .update(&device_id, ctx.generation, |entry| {
                        entry.pending_pairing = Some(code)
                    })
                    .await;
                debug!(device_id = %device_id, "Pairing code refreshed");
                Flow::Continue
            }

            Action::PersistCredentials(credentials) => {
                match self
                    .inner
                    .store
                    .persist_credentials(&ctx.session, &credentials)
                    .await
                {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        error!(device_id = %device_id, error = %e, "Failed to persist credentials");
                        if ctx.outcome.is_none() {
                            return Flow::Continue;
                        }
                        ctx.resolve(Err(e));
                        ctx.handle.shutdown().await;
                        registry.remove_if_generation(&device_id, ctx.generation).await;
                        Flow::Stop
                    }
                }
            }

            Action::MarkConnected => {
                registry
                    .update(&device_id, ctx.generation, |entry| {
                        entry.connected = true;
                        entry.last_error = None;
                        entry.pending_pairing = None;
                    })
                    .await;
                info!(device_id = %device_id, "Device connected");
                ctx.resolve(Ok(ConnectOutcome::Connected));
                Flow::Continue
            }

            Action::RejectIdentity { connected_number } => {
                let mismatch = DeviceError::IdentityMismatch {
                    expected: ctx.config.phone_number.clone(),
                    actual: connected_number,
                };
                error!(device_id = %device_id, error = %mismatch, "Wrong phone paired, logging out");

                if let Err(e) = ctx.handle.logout().await {
                    warn!(device_id = %device_id, error = %e, "Logout after identity mismatch failed");
                }
                ctx.handle.shutdown().await;
                if let Err(e) = self.inner.store.delete(&ctx.session).await {
                    error!(device_id = %device_id, error = %e, "Failed to delete mismatched session");
                }

                let message = mismatch.to_string();
                registry
                    .update(&device_id, ctx.generation, |entry| {
                        entry.connected = false;
                        entry.handle = None;
                        entry.pending_pairing = None;
                        entry.last_error = Some(message);
                    })
                    .await;
                ctx.resolve(Err(mismatch));
                Flow::Stop
            }

            Action::MarkDisconnected => {
                registry
                    .set_connected(&device_id, ctx.generation, false)
                    .await;
                Flow::Continue
            }

            Action::PurgeSession => {
                warn!(device_id = %device_id, "Device logged out, removing session");
                ctx.handle.shutdown().await;
                if let Err(e) = self.inner.store.delete(&ctx.session).await {
                    error!(device_id = %device_id, error = %e, "Failed to delete session");
                }
                registry.remove_if_generation(&device_id, ctx.generation).await;
                ctx.resolve(Err(DeviceError::LoggedOut));
                Flow::Stop
            }

            Action::ScheduleReconnect => {
                ctx.handle.shutdown().await;

                let paired = self.inner.store.has_credentials(&ctx.session).await;
                if !paired && ctx.outcome.is_none() {
                    info!(device_id = %device_id, "Unpaired connection closed, not reconnecting");
                    registry.remove_if_generation(&device_id, ctx.generation).await;
                    return Flow::Stop;
                }

                warn!(device_id = %device_id, "Connection dropped, scheduling reconnect");
                tokio::spawn(self.clone().reconnect(
                    ctx.config.clone(),
                    ctx.generation,
                    ctx.outcome.take(),
                ));
                Flow::Stop
            }

            Action::Route(message) => {
                self.inner.router.dispatch(ctx.config.clone(), message);
                Flow::Continue
            }
        }
    }

    /// Retry with exponential backoff while the dropped entry is still current
    fn reconnect(
        self,
        config: DeviceConfig,
        generation: u64,
        mut outcome: Option<OutcomeSender>,
    ) -> BoxedTask {
        Box::pin(async move {
            let settings = &self.inner.settings;
            let mut delay = settings.reconnect_base_delay;

            for attempt in 1..=settings.reconnect_max_attempts {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;

                if !self.inner.registry.is_current(&config.id, generation).await {
                    debug!(device_id = %config.id, "Reconnect cancelled, device was replaced or removed");
                    return;
                }

                match self.start(config.clone(), false, &mut outcome).await {
                    Ok(()) => {
                        info!(device_id = %config.id, attempt, "Reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(device_id = %config.id, attempt, error = %e, "Reconnect attempt failed");
                    }
                }
                delay = (delay * 2).min(settings.reconnect_max_delay);
            }

            error!(device_id = %config.id, "Giving up reconnecting");
            self.inner
                .registry
                .update(&config.id, generation, |entry| {
                    entry.last_error = Some("reconnect attempts exhausted".to_string());
                })
                .await;
            if let Some(tx) = outcome {
                let _ = tx.send(Err(DeviceError::ConnectionClosed));
            }
        })
    }

    /// Drop a connection that never became ready
    async fn abandon(&self, device_id: &str) {
        let Some(entry) = self.inner.registry.get(device_id).await else {
            return;
        };
        if entry.connected {
            return;
        }

        self.inner
            .registry
            .remove_if_generation(device_id, entry.generation)
            .await;
        if let Some(handle) = entry.handle {
            handle.shutdown().await;
        }
    }
}
