use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use shared::domain::UserId;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod call_session;
pub mod config;
pub mod error;
pub mod ledger;
pub mod media;
pub mod reconciler;
pub mod rich;
pub mod signal;
pub mod transport;

use crate::{
    call_session::{CallEffect, CallSession, CallState, Ring, Session, SignalOutcome},
    config::ClientSettings,
    error::ClientError,
    media::{CaptureDevice, MediaIntentController, Presentation},
    reconciler::{MessageReconciler, TranscriptEntry},
    rich::{encode_rich, mime_type_for, RichAttachment, RichMessage},
    signal::{encode, format_duration, CallSignal, CallType, MediaKind},
    transport::{HttpMessageChannel, MessageChannel},
};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    TranscriptUpdated {
        counterpart: UserId,
        entries: Vec<TranscriptEntry>,
    },
    NotificationSound,
    SessionStateChanged {
        from: CallState,
        to: CallState,
        session: Option<Session>,
    },
    Ringing(Ring),
    RingingStopped,
    CallTimerTick {
        elapsed: String,
    },
    RemoteMediaChanged {
        kind: MediaKind,
        enabled: bool,
    },
    MediaPresentationChanged(Presentation),
    ContactDiscovered(UserId),
}

enum Outbound {
    Deliver {
        to: UserId,
        signal: CallSignal,
        attempts: u32,
    },
    Flush(oneshot::Sender<()>),
}

struct ClientContext {
    call: CallSession,
    reconciler: MessageReconciler,
    call_timer: Option<JoinHandle<()>>,
}

pub struct SignalingClient {
    user: UserId,
    settings: ClientSettings,
    channel: Arc<dyn MessageChannel>,
    media: Arc<MediaIntentController>,
    inner: Mutex<ClientContext>,
    events: broadcast::Sender<ClientEvent>,
    poll_seq: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Must be called inside a Tokio runtime; spawns the outbound queue worker.
    pub fn new(
        user: UserId,
        channel: Arc<dyn MessageChannel>,
        device: Arc<dyn CaptureDevice>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbound_queue(
            user.clone(),
            Arc::clone(&channel),
            settings.handshake_retry_delay(),
            outbound_rx,
        ));
        Arc::new(Self {
            media: Arc::new(MediaIntentController::new(
                device,
                settings.mirror_local_preview,
            )),
            user,
            settings,
            channel,
            inner: Mutex::new(ClientContext {
                call: CallSession::new(),
                reconciler: MessageReconciler::new(),
                call_timer: None,
            }),
            events,
            poll_seq: AtomicU64::new(0),
            outbound,
            poller: Mutex::new(None),
        })
    }

    pub async fn connect(
        user: &str,
        device: Arc<dyn CaptureDevice>,
        settings: ClientSettings,
    ) -> Result<Arc<Self>, ClientError> {
        let channel = HttpMessageChannel::new(&settings.server_url)?;
        let user = channel.login(&UserId::new(user)).await?;
        info!(%user, server_url = %settings.server_url, "client: connected");
        Ok(Self::new(user, Arc::new(channel), device, settings))
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn select_counterpart(&self, counterpart: UserId) {
        let mut ctx = self.inner.lock().await;
        debug!(%counterpart, "client: conversation selected");
        ctx.reconciler.select_counterpart(counterpart);
    }

    pub async fn active_counterpart(&self) -> Option<UserId> {
        self.inner.lock().await.reconciler.active_counterpart().cloned()
    }

    pub async fn call_state(&self) -> CallState {
        self.inner.lock().await.call.state()
    }

    pub async fn session_snapshot(&self) -> Option<Session> {
        self.inner.lock().await.call.session().cloned()
    }

    pub async fn desync_events(&self) -> u64 {
        self.inner.lock().await.call.desync_events()
    }

    pub async fn presentation(&self) -> Presentation {
        self.media.presentation().await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let to = self.require_counterpart().await?;
        self.channel.send_message(&self.user, &to, text).await?;
        Ok(())
    }

    pub async fn send_rich(
        &self,
        text: &str,
        files: Vec<RichAttachment>,
    ) -> Result<(), ClientError> {
        if files.is_empty() {
            return self.send_text(text).await;
        }
        let to = self.require_counterpart().await?;
        let content = encode_rich(&RichMessage {
            text: text.to_string(),
            files,
        });
        self.channel.send_message(&self.user, &to, &content).await?;
        Ok(())
    }

    pub async fn place_call(&self, call_type: CallType) -> Result<(), ClientError> {
        let mut ctx = self.inner.lock().await;
        let peer = ctx
            .reconciler
            .active_counterpart()
            .cloned()
            .ok_or(ClientError::NoActiveCounterpart)?;
        let effects = ctx.call.place_call(peer, call_type)?;
        self.apply_effects(&mut ctx, effects).await;
        Ok(())
    }

    pub async fn accept_call(&self) -> Result<(), ClientError> {
        let mut ctx = self.inner.lock().await;
        let effects = ctx.call.accept_call(Instant::now())?;
        self.apply_effects(&mut ctx, effects).await;
        Ok(())
    }

    pub async fn hang_up(&self) -> Result<(), ClientError> {
        let mut ctx = self.inner.lock().await;
        let effects = ctx.call.hang_up(Instant::now())?;
        self.apply_effects(&mut ctx, effects).await;
        Ok(())
    }

    pub async fn toggle_mute(&self) -> Result<(), ClientError> {
        self.toggle_local_media(MediaKind::Audio).await
    }

    pub async fn toggle_camera(&self) -> Result<(), ClientError> {
        self.toggle_local_media(MediaKind::Video).await
    }

    async fn toggle_local_media(&self, kind: MediaKind) -> Result<(), ClientError> {
        let mut ctx = self.inner.lock().await;
        let effects = ctx.call.toggle_local_media(kind)?;
        self.apply_effects(&mut ctx, effects).await;
        Ok(())
    }

    /// Fetches the inbox once and applies it. Safe to run concurrently with
    /// itself; results are applied in arrival order.
    pub async fn poll_once(&self) -> Result<(), ClientError> {
        let ticket = self.poll_seq.fetch_add(1, Ordering::SeqCst);
        let inbox = match self.channel.fetch_inbox(&self.user).await {
            Ok(inbox) => inbox,
            Err(err) => {
                warn!(ticket, error = %err, "poll: fetch failed");
                return Err(err.into());
            }
        };

        let mut ctx = self.inner.lock().await;
        let outcome = ctx.reconciler.reconcile(ticket, &inbox);
        let shown = ctx.reconciler.active_counterpart().cloned();

        for contact in outcome.discovered_contacts {
            let _ = self.events.send(ClientEvent::ContactDiscovered(contact));
        }
        for inbound in outcome.signals {
            let applied = ctx
                .call
                .handle_signal(&inbound.from, &inbound.signal, Instant::now());
            if let SignalOutcome::Applied(effects) = applied {
                self.apply_effects(&mut ctx, effects).await;
            }
        }
        let active = ctx.reconciler.active_counterpart().cloned();
        let transcript = if active != shown {
            active.as_ref().map(|_| ctx.reconciler.render(&inbox))
        } else {
            outcome.transcript
        };
        if let (Some(entries), Some(counterpart)) = (transcript, active) {
            let _ = self.events.send(ClientEvent::TranscriptUpdated {
                counterpart,
                entries,
            });
        }
        if outcome.play_notification {
            let _ = self.events.send(ClientEvent::NotificationSound);
        }
        Ok(())
    }

    pub async fn start_polling(self: &Arc<Self>) {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }
        let client: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.poll_interval();
        *poller = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = client.poll_once().await;
                });
            }
        }));
        info!(user = %self.user, period_ms = period.as_millis() as u64, "client: polling started");
    }

    /// Stops polling and hangs up any call in progress, releasing capture and
    /// queueing `end` for the peer. Follow with [`Self::flush_outbound`] to
    /// deliver it.
    pub async fn stop(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        let mut ctx = self.inner.lock().await;
        if ctx.call.state() != CallState::Idle {
            match ctx.call.hang_up(Instant::now()) {
                Ok(effects) => self.apply_effects(&mut ctx, effects).await,
                Err(err) => warn!(error = %err, "client: hang-up on stop failed"),
            }
        }
        if let Some(timer) = ctx.call_timer.take() {
            timer.abort();
        }
    }

    pub async fn flush_outbound(&self) {
        let (done, wait) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn require_counterpart(&self) -> Result<UserId, ClientError> {
        self.active_counterpart()
            .await
            .ok_or(ClientError::NoActiveCounterpart)
    }

    async fn apply_effects(&self, ctx: &mut ClientContext, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Transition { from, to } => {
                    let _ = self.events.send(ClientEvent::SessionStateChanged {
                        from,
                        to,
                        session: ctx.call.session().cloned(),
                    });
                }
                CallEffect::Send { to, signal } => self.enqueue_signal(to, signal),
                CallEffect::StartRinging(ring) => {
                    if let Ring::Incoming { from, .. } = &ring {
                        if ctx.reconciler.active_counterpart() != Some(from) {
                            debug!(caller = %from, "client: switching conversation to caller");
                            ctx.reconciler.select_counterpart(from.clone());
                        }
                    }
                    let _ = self.events.send(ClientEvent::Ringing(ring));
                }
                CallEffect::StopRinging => {
                    let _ = self.events.send(ClientEvent::RingingStopped);
                }
                CallEffect::EnterLive {
                    peer,
                    call_type,
                    started_at,
                } => {
                    if let Some(timer) = ctx.call_timer.take() {
                        timer.abort();
                    }
                    ctx.call_timer = Some(self.spawn_call_timer(started_at));

                    // Claimed inline so a later teardown always wins the race.
                    let generation = self.media.begin_live().await;
                    let media = Arc::clone(&self.media);
                    let events = self.events.clone();
                    debug!(%peer, ?call_type, generation, "client: acquiring capture");
                    tokio::spawn(async move {
                        let presentation = media.complete_live(generation, call_type).await;
                        if presentation != Presentation::Inactive {
                            let _ = events.send(ClientEvent::MediaPresentationChanged(presentation));
                        }
                    });
                }
                CallEffect::Teardown => {
                    if let Some(timer) = ctx.call_timer.take() {
                        timer.abort();
                    }
                    self.media.on_leave_live().await;
                    let _ = self
                        .events
                        .send(ClientEvent::MediaPresentationChanged(Presentation::Inactive));
                }
                CallEffect::SetLocalTrack { kind, enabled } => {
                    self.media.set_track_enabled(kind, enabled).await;
                }
                CallEffect::RemoteMediaChanged { kind, enabled } => {
                    let _ = self
                        .events
                        .send(ClientEvent::RemoteMediaChanged { kind, enabled });
                }
            }
        }
    }

    fn enqueue_signal(&self, to: UserId, signal: CallSignal) {
        let attempts = if signal.is_handshake() {
            self.settings.handshake_send_attempts.max(1)
        } else {
            1
        };
        if self
            .outbound
            .send(Outbound::Deliver {
                to,
                signal,
                attempts,
            })
            .is_err()
        {
            warn!("outbound: queue worker gone; signal dropped");
        }
    }

    fn spawn_call_timer(&self, started_at: Instant) -> JoinHandle<()> {
        let events = self.events.clone();
        let tick = self.settings.call_timer_tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let _ = events.send(ClientEvent::CallTimerTick {
                    elapsed: format_duration(started_at.elapsed()),
                });
            }
        })
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().call_timer.take() {
            timer.abort();
        }
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}

pub async fn read_attachment(path: &Path) -> Result<RichAttachment, ClientError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ClientError::Attachment {
            path: path.to_path_buf(),
            source,
        })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let mime_type = mime_type_for(&name);
    Ok(RichAttachment::from_bytes(name, mime_type, &bytes))
}

/// Single ordered sender. Handshake signals get `attempts` tries; everything
/// else is best-effort. Failures are logged only.
async fn run_outbound_queue(
    user: UserId,
    channel: Arc<dyn MessageChannel>,
    retry_delay: Duration,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = queue.recv().await {
        let (to, signal, attempts) = match item {
            Outbound::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            Outbound::Deliver {
                to,
                signal,
                attempts,
            } => (to, signal, attempts),
        };
        let content = encode(&signal);
        let mut attempt = 1;
        loop {
            match channel.send_message(&user, &to, &content).await {
                Ok(()) => {
                    debug!(peer = %to, sub_type = signal.sub_type(), attempt, "outbound: signal sent");
                    break;
                }
                Err(err) if attempt < attempts => {
                    debug!(peer = %to, sub_type = signal.sub_type(), attempt, error = %err, "outbound: send failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(retry_delay).await;
                }
                Err(err) => {
                    warn!(peer = %to, sub_type = signal.sub_type(), attempts = attempt, error = %err, "outbound: signal dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
