use std::collections::HashSet;

use shared::{
    domain::{Direction, Seconds, UserId},
    protocol::MessageRecord,
};
use tracing::debug;

use crate::{
    ledger::{DedupLedger, Fingerprint},
    rich::{decode_rich, RichMessage},
    signal::{self, CallSignal},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    Text(String),
    Rich(RichMessage),
    SystemLog { content: String, duration: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub direction: Direction,
    pub timestamp: Seconds,
    pub body: EntryBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Signal(CallSignal),
    Chat(EntryBody),
}

pub fn classify(content: &str) -> RecordKind {
    if let Ok(signal) = signal::decode(content) {
        return RecordKind::Signal(signal);
    }
    match decode_rich(content) {
        Some(rich) => RecordKind::Chat(EntryBody::Rich(rich)),
        None => RecordKind::Chat(EntryBody::Text(content.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub from: UserId,
    pub fingerprint: Fingerprint,
    pub signal: CallSignal,
}

#[derive(Debug, Default)]
pub struct TranscriptViewState {
    pub last_rendered_serialization: String,
    pub last_message_count: usize,
}

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub signals: Vec<InboundSignal>,
    pub transcript: Option<Vec<TranscriptEntry>>,
    pub play_notification: bool,
    pub discovered_contacts: Vec<UserId>,
}

#[derive(Debug)]
pub struct MessageReconciler {
    ledger: DedupLedger,
    view: TranscriptViewState,
    active: Option<UserId>,
    first_poll_after_switch: bool,
    newest_applied: Option<u64>,
    known_contacts: HashSet<UserId>,
}

impl Default for MessageReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self {
            ledger: DedupLedger::new(),
            view: TranscriptViewState::default(),
            active: None,
            first_poll_after_switch: true,
            newest_applied: None,
            known_contacts: HashSet::new(),
        }
    }

    pub fn active_counterpart(&self) -> Option<&UserId> {
        self.active.as_ref()
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn view(&self) -> &TranscriptViewState {
        &self.view
    }

    pub fn select_counterpart(&mut self, counterpart: UserId) {
        self.known_contacts.insert(counterpart.clone());
        self.active = Some(counterpart);
        self.view.last_rendered_serialization.clear();
        self.first_poll_after_switch = true;
    }

    /// Applies one poll result. `ticket` is the poll's issue order; results
    /// may arrive out of that order.
    pub fn reconcile(&mut self, ticket: u64, inbox: &[MessageRecord]) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        for record in inbox {
            if record.direction != Direction::Received {
                continue;
            }
            if self.known_contacts.insert(record.counterpart.clone()) {
                outcome.discovered_contacts.push(record.counterpart.clone());
            }
            let Ok(signal) = signal::decode(&record.content) else {
                continue;
            };
            if !signal.is_actionable() {
                continue;
            }
            let fingerprint = Fingerprint::of(record);
            if self.ledger.mark_processed(fingerprint.clone()) {
                outcome.signals.push(InboundSignal {
                    from: record.counterpart.clone(),
                    fingerprint,
                    signal,
                });
            }
        }

        if self.newest_applied.is_some_and(|newest| ticket < newest) {
            debug!(ticket, "reconcile: stale poll; signals only");
            return outcome;
        }
        self.newest_applied = Some(ticket);

        let serialization = match serde_json::to_string(inbox) {
            Ok(serialization) => serialization,
            Err(err) => {
                debug!(error = %err, "reconcile: inbox serialization failed");
                return outcome;
            }
        };
        let count = inbox.len();
        if serialization != self.view.last_rendered_serialization {
            outcome.play_notification =
                count > self.view.last_message_count && !self.first_poll_after_switch;
            outcome.transcript = Some(self.render(inbox));
            self.view.last_rendered_serialization = serialization;
        }
        self.view.last_message_count = count;
        self.first_poll_after_switch = false;
        outcome
    }

    pub fn render(&self, inbox: &[MessageRecord]) -> Vec<TranscriptEntry> {
        let Some(active) = &self.active else {
            return Vec::new();
        };
        inbox
            .iter()
            .filter(|record| &record.counterpart == active)
            .filter_map(|record| {
                let body = match classify(&record.content) {
                    RecordKind::Signal(CallSignal::SystemLog { content, duration }) => {
                        EntryBody::SystemLog { content, duration }
                    }
                    RecordKind::Signal(_) => return None,
                    RecordKind::Chat(body) => body,
                };
                Some(TranscriptEntry {
                    direction: record.direction,
                    timestamp: record.timestamp,
                    body,
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
