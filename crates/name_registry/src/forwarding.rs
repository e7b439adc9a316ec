use crate::types::{AccountId, ForwardedCall};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a forwarding backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("recipient {0} rejected the call")]
    Rejected(AccountId),
    #[error("forwarding backend error: {0}")]
    Backend(String),
}

/// Delivers a value-bearing call to the account a name resolves to.
///
/// Implementations may call back into the registry; the registry holds no lock while a
/// forward is in progress.
pub trait CallForwarder: Send + Sync {
    fn forward(&self, call: &ForwardedCall) -> Result<Vec<u8>, ForwardError>;
}

/// Accepts every call and returns empty output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopForwarder;

impl CallForwarder for NoopForwarder {
    fn forward(&self, _call: &ForwardedCall) -> Result<Vec<u8>, ForwardError> {
        Ok(Vec::new())
    }
}

/// Calls kept per recipient before the oldest are dropped.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

#[derive(Default)]
struct Inbox {
    delivered: u64,
    calls: VecDeque<ForwardedCall>,
}

/// In-memory delivery into bounded per-recipient inboxes.
#[derive(Clone)]
pub struct InboxForwarder {
    inboxes: Arc<RwLock<HashMap<AccountId, Inbox>>>,
    rejecting: Arc<RwLock<HashSet<AccountId>>>,
    capacity: usize,
}

impl Default for InboxForwarder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl InboxForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` calls per recipient (minimum one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inboxes: Arc::default(),
            rejecting: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Retained calls delivered to `account`, oldest first.
    pub fn inbox(&self, account: &AccountId) -> Vec<ForwardedCall> {
        self.inboxes
            .read()
            .get(account)
            .map(|inbox| inbox.calls.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total calls ever delivered to `account`, including dropped ones.
    pub fn delivered(&self, account: &AccountId) -> u64 {
        self.inboxes
            .read()
            .get(account)
            .map_or(0, |inbox| inbox.delivered)
    }

    /// Make deliveries to `account` fail from now on.
    pub fn reject(&self, account: AccountId) {
        self.rejecting.write().insert(account);
    }

    pub fn accept(&self, account: &AccountId) {
        self.rejecting.write().remove(account);
    }
}

impl CallForwarder for InboxForwarder {
    fn forward(&self, call: &ForwardedCall) -> Result<Vec<u8>, ForwardError> {
        if self.rejecting.read().contains(&call.to) {
            return Err(ForwardError::Rejected(call.to));
        }
        let mut inboxes = self.inboxes.write();
        let inbox = inboxes.entry(call.to).or_default();
        if inbox.calls.len() >= self.capacity {
            inbox.calls.pop_front();
        }
        inbox.calls.push_back(call.clone());
        inbox.delivered += 1;
        // Output is the recipient's delivery sequence number.
        Ok(inbox.delivered.to_be_bytes().to_vec())
    }
}
