use std::collections::HashSet;

use shared::{
    domain::{Seconds, UserId},
    protocol::MessageRecord,
};

/// Identity of a physical signal envelope: who sent it and when.
///
/// Two envelopes from the same counterpart within the same second collapse to
/// one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub counterpart: UserId,
    pub timestamp: Seconds,
}

impl Fingerprint {
    pub fn new(counterpart: UserId, timestamp: Seconds) -> Self {
        Self {
            counterpart,
            timestamp,
        }
    }

    pub fn of(record: &MessageRecord) -> Self {
        Self::new(record.counterpart.clone(), record.timestamp)
    }
}

#[derive(Debug, Default)]
pub struct DedupLedger {
    processed: HashSet<Fingerprint>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_been_processed(&self, fingerprint: &Fingerprint) -> bool {
        self.processed.contains(fingerprint)
    }

    /// Returns `false` if the fingerprint was already present.
    pub fn mark_processed(&mut self, fingerprint: Fingerprint) -> bool {
        self.processed.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
