use std::time::Instant;

use shared::domain::UserId;
use tracing::{debug, info};

use crate::{
    error::CallError,
    signal::{format_duration, CallSignal, CallType, MediaKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Live,
    /// Transient; always collapses to `Idle` within the same operation.
    Ending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peer: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: Option<Instant>,
    pub local_audio_enabled: bool,
    pub local_video_enabled: bool,
    pub remote_audio_enabled: bool,
    pub remote_video_enabled: bool,
}

impl Session {
    fn new(peer: UserId, call_type: CallType, state: CallState) -> Self {
        Self {
            peer,
            call_type,
            state,
            started_at: None,
            local_audio_enabled: true,
            local_video_enabled: true,
            remote_audio_enabled: true,
            remote_video_enabled: true,
        }
    }

    fn local_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.local_audio_enabled,
            MediaKind::Video => self.local_video_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ring {
    Outgoing { to: UserId, call_type: CallType },
    Incoming { from: UserId, call_type: CallType },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    Transition {
        from: CallState,
        to: CallState,
    },
    Send {
        to: UserId,
        signal: CallSignal,
    },
    StartRinging(Ring),
    StopRinging,
    /// Acquire capture for `call_type` and start the call timer.
    EnterLive {
        peer: UserId,
        call_type: CallType,
        started_at: Instant,
    },
    /// Release capture and stop the call timer. Safe to repeat.
    Teardown,
    SetLocalTrack {
        kind: MediaKind,
        enabled: bool,
    },
    RemoteMediaChanged {
        kind: MediaKind,
        enabled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Busy,
    WrongState,
    ForeignPeer,
    NotActionable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied(Vec<CallEffect>),
    Ignored(IgnoreReason),
}

#[derive(Debug, Default)]
pub struct CallSession {
    session: Option<Session>,
    desync_events: u64,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn desync_events(&self) -> u64 {
        self.desync_events
    }

    pub fn place_call(
        &mut self,
        peer: UserId,
        call_type: CallType,
    ) -> Result<Vec<CallEffect>, CallError> {
        self.require(CallState::Idle, "place a call")?;
        self.session = Some(Session::new(peer.clone(), call_type, CallState::Dialing));
        info!(%peer, ?call_type, "call: dialing");
        Ok(vec![
            transition(CallState::Idle, CallState::Dialing),
            CallEffect::Send {
                to: peer.clone(),
                signal: CallSignal::Offer { call_type },
            },
            CallEffect::StartRinging(Ring::Outgoing { to: peer, call_type }),
        ])
    }

    pub fn accept_call(&mut self, now: Instant) -> Result<Vec<CallEffect>, CallError> {
        self.require(CallState::Ringing, "accept")?;
        let mut effects = Vec::with_capacity(5);
        if let Some(session) = &self.session {
            effects.push(CallEffect::Send {
                to: session.peer.clone(),
                signal: CallSignal::Accept,
            });
        }
        effects.extend(self.enter_live(now));
        Ok(effects)
    }

    pub fn hang_up(&mut self, now: Instant) -> Result<Vec<CallEffect>, CallError> {
        match self.state() {
            CallState::Dialing | CallState::Ringing | CallState::Live => Ok(self.terminate(now, true)),
            _ => Err(CallError::NoActiveCall),
        }
    }

    pub fn set_local_media(
        &mut self,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<Vec<CallEffect>, CallError> {
        self.require(CallState::Live, "change local media")?;
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        match kind {
            MediaKind::Audio => session.local_audio_enabled = enabled,
            MediaKind::Video => session.local_video_enabled = enabled,
        }
        Ok(vec![
            CallEffect::SetLocalTrack { kind, enabled },
            CallEffect::Send {
                to: session.peer.clone(),
                signal: CallSignal::MediaState {
                    media_kind: kind,
                    enabled,
                },
            },
        ])
    }

    pub fn toggle_local_media(&mut self, kind: MediaKind) -> Result<Vec<CallEffect>, CallError> {
        self.require(CallState::Live, "change local media")?;
        let enabled = self
            .session
            .as_ref()
            .map(|session| !session.local_enabled(kind))
            .unwrap_or(true);
        self.set_local_media(kind, enabled)
    }

    pub fn handle_signal(&mut self, from: &UserId, signal: &CallSignal, now: Instant) -> SignalOutcome {
        let state = self.state();
        let outcome = match signal {
            CallSignal::Offer { call_type } => {
                if state == CallState::Idle {
                    self.session = Some(Session::new(from.clone(), *call_type, CallState::Ringing));
                    info!(peer = %from, ?call_type, "call: incoming offer");
                    SignalOutcome::Applied(vec![
                        transition(CallState::Idle, CallState::Ringing),
                        CallEffect::StartRinging(Ring::Incoming {
                            from: from.clone(),
                            call_type: *call_type,
                        }),
                    ])
                } else {
                    SignalOutcome::Ignored(IgnoreReason::Busy)
                }
            }
            CallSignal::Accept => match self.check_peer(from, &[CallState::Dialing]) {
                Ok(()) => SignalOutcome::Applied(self.enter_live(now)),
                Err(reason) => SignalOutcome::Ignored(reason),
            },
            CallSignal::End => {
                match self.check_peer(from, &[CallState::Dialing, CallState::Ringing, CallState::Live]) {
                    Ok(()) => SignalOutcome::Applied(self.terminate(now, false)),
                    Err(reason) => SignalOutcome::Ignored(reason),
                }
            }
            CallSignal::MediaState {
                media_kind,
                enabled,
            } => match self.check_peer(from, &[CallState::Live]) {
                Ok(()) => {
                    if let Some(session) = self.session.as_mut() {
                        match media_kind {
                            MediaKind::Audio => session.remote_audio_enabled = *enabled,
                            MediaKind::Video => session.remote_video_enabled = *enabled,
                        }
                    }
                    SignalOutcome::Applied(vec![CallEffect::RemoteMediaChanged {
                        kind: *media_kind,
                        enabled: *enabled,
                    }])
                }
                Err(reason) => SignalOutcome::Ignored(reason),
            },
            CallSignal::SystemLog { .. } => SignalOutcome::Ignored(IgnoreReason::NotActionable),
        };

        match &outcome {
            SignalOutcome::Ignored(IgnoreReason::Busy) => {
                debug!(peer = %from, ?state, "call: offer dropped while busy");
            }
            SignalOutcome::Ignored(reason @ (IgnoreReason::WrongState | IgnoreReason::ForeignPeer)) => {
                self.desync_events += 1;
                debug!(
                    desync = true,
                    peer = %from,
                    sub_type = signal.sub_type(),
                    ?state,
                    ?reason,
                    total = self.desync_events,
                    "call: signal ignored"
                );
            }
            _ => {}
        }
        outcome
    }

    fn require(&self, expected: CallState, action: &'static str) -> Result<(), CallError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(CallError::InvalidState { action, state })
        }
    }

    fn check_peer(&self, from: &UserId, allowed: &[CallState]) -> Result<(), IgnoreReason> {
        let Some(session) = &self.session else {
            return Err(IgnoreReason::WrongState);
        };
        if !allowed.contains(&session.state) {
            return Err(IgnoreReason::WrongState);
        }
        if &session.peer != from {
            return Err(IgnoreReason::ForeignPeer);
        }
        Ok(())
    }

    fn enter_live(&mut self, now: Instant) -> Vec<CallEffect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let from = session.state;
        session.state = CallState::Live;
        session.started_at = Some(now);
        session.local_audio_enabled = true;
        session.local_video_enabled = true;
        info!(peer = %session.peer, call_type = ?session.call_type, "call: live");
        vec![
            CallEffect::StopRinging,
            transition(from, CallState::Live),
            CallEffect::EnterLive {
                peer: session.peer.clone(),
                call_type: session.call_type,
                started_at: now,
            },
        ]
    }

    fn terminate(&mut self, now: Instant, locally_initiated: bool) -> Vec<CallEffect> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        let from = session.state;

        let mut effects = vec![transition(from, CallState::Ending)];
        if from == CallState::Live {
            let elapsed = session
                .started_at
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();
            effects.push(CallEffect::Send {
                to: session.peer.clone(),
                signal: CallSignal::SystemLog {
                    content: format!("{} call ended", session.call_type.label()),
                    duration: format_duration(elapsed),
                },
            });
        } else {
            effects.push(CallEffect::StopRinging);
        }
        effects.push(CallEffect::Teardown);
        if locally_initiated {
            effects.push(CallEffect::Send {
                to: session.peer.clone(),
                signal: CallSignal::End,
            });
        }
        effects.push(transition(CallState::Ending, CallState::Idle));
        info!(peer = %session.peer, ?from, locally_initiated, "call: ended");
        effects
    }
}

fn transition(from: CallState, to: CallState) -> CallEffect {
    CallEffect::Transition { from, to }
}

#[cfg(test)]
#[path = "tests/call_session_tests.rs"]
mod tests;
