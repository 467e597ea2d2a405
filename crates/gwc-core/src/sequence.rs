use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Operation classes whose in-flight results can be superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// API key validation; the chained model listing shares this class.
    KeyValidation,
    SnapshotFetch,
    ChannelConnect,
    PairingStream,
    ApprovalPoll,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::KeyValidation => "key_validation",
            OperationClass::SnapshotFetch => "snapshot_fetch",
            OperationClass::ChannelConnect => "channel_connect",
            OperationClass::PairingStream => "pairing_stream",
            OperationClass::ApprovalPoll => "approval_poll",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken(u64);

impl SequenceToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues monotonically increasing tokens per operation class.
///
/// Capture a token with [`SequenceGuard::next_token`] before starting an
/// async operation and check it with [`SequenceGuard::is_current`] when the
/// result arrives. Issuing a newer token for the class invalidates every
/// older one, so only the latest request's result is ever applied.
#[derive(Debug, Clone)]
pub struct SequenceGuard<K = OperationClass> {
    counters: HashMap<K, u64>,
}

impl<K> Default for SequenceGuard<K> {
    fn default() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> SequenceGuard<K> {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn next_token(&mut self, class: K) -> SequenceToken {
        let counter = self.counters.entry(class).or_insert(0);
        *counter += 1;
        SequenceToken(*counter)
    }

    pub fn is_current(&self, class: &K, token: SequenceToken) -> bool {
        self.counters
            .get(class)
            .map(|current| *current == token.0)
            .unwrap_or(false)
    }

    pub fn current(&self, class: &K) -> Option<SequenceToken> {
        self.counters.get(class).copied().map(SequenceToken)
    }
}
