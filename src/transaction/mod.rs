
use std::collections::HashMap;

use stun::agent::TransactionId;
use tokio::time::{Duration, Instant};

/// Initial retransmission timeout for request/response transactions over
/// unreliable transports.
pub const STUN_TIMER_DEFAULT_TIMEOUT: Duration = Duration::from_millis(600);

/// How many times an unanswered request is retransmitted before the
/// transaction times out.
pub const STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS: u32 = 3;

/// Single-shot timeout used on reliable transports, where the transport
/// retransmits and only one long deadline is needed.
pub const STUN_TIMER_RELIABLE_TIMEOUT: Duration = Duration::from_millis(7900);

/// Outcome of advancing a retransmission timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCheck {
    /// The deadline passed and a retransmission is due; the timer has
    /// re-armed itself with a doubled timeout.
    Retransmit,
    /// The deadline passed with no retransmissions left.
    Timeout,
    /// The deadline has not been reached yet.
    Pending,
}

/// Exponential-backoff retransmission timer for one STUN transaction.
#[derive(Clone, Debug)]
pub struct StunTimer {
    deadline: Instant,
    delay: Duration,
    retransmissions_left: u32,
}

impl StunTimer {
    /// Arms the timer for an unreliable transport: retransmit on each
    /// expiry, doubling the timeout, until the budget is spent.
    #[must_use]
    pub fn start(now: Instant, rto: Duration, max_retransmissions: u32) -> Self {
        Self {
            deadline: now + rto,
            delay: rto,
            retransmissions_left: max_retransmissions,
        }
    }

    /// Arms a one-shot long deadline for a reliable transport.
    #[must_use]
    pub fn start_reliable(now: Instant) -> Self {
        Self {
            deadline: now + STUN_TIMER_RELIABLE_TIMEOUT,
            delay: STUN_TIMER_RELIABLE_TIMEOUT,
            retransmissions_left: 0,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Advances the timer against `now`.
    pub fn refresh(&mut self, now: Instant) -> TimerCheck {
        if now < self.deadline {
            return TimerCheck::Pending;
        }
        if self.retransmissions_left == 0 {
            return TimerCheck::Timeout;
        }
        self.retransmissions_left -= 1;
        self.delay *= 2;
        self.deadline = now + self.delay;
        TimerCheck::Retransmit
    }

    /// Re-arms the timer from scratch with its original budget restored.
    /// Used for the single allowed restart of an in-progress check.
    pub fn restart(&mut self, now: Instant, rto: Duration, max_retransmissions: u32) {
        *self = Self::start(now, rto, max_retransmissions);
    }
}

/// One in-flight STUN request: the encoded bytes (kept for retransmission)
/// and the timer driving them.
#[derive(Clone, Debug)]
pub struct StunTransaction {
    pub id: TransactionId,
    pub buffer: Vec<u8>,
    pub timer: StunTimer,
}

impl StunTransaction {
    #[must_use]
    pub fn new(id: TransactionId, buffer: Vec<u8>, timer: StunTimer) -> Self {
        Self { id, buffer, timer }
    }
}

/// The per-agent table of outstanding transactions. Responses are matched
/// here; a forgotten id silently discards any late response.
pub struct TransactionTable<O> {
    outstanding: HashMap<TransactionId, O>,
}

impl<O> Default for TransactionTable<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> TransactionTable<O> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Registers an outstanding transaction. Re-registering the same id
    /// replaces the previous owner.
    pub fn register(&mut self, id: TransactionId, owner: O) {
        self.outstanding.insert(id, owner);
    }

    /// Removes the transaction so a belated response is never matched.
    pub fn forget(&mut self, id: &TransactionId) -> Option<O> {
        self.outstanding.remove(id)
    }

    /// Looks up and consumes the owner for an inbound response.
    pub fn take(&mut self, id: &TransactionId) -> Option<O> {
        self.outstanding.remove(id)
    }

    pub fn get(&self, id: &TransactionId) -> Option<&O> {
        self.outstanding.get(id)
    }

    pub fn retain(&mut self, keep: impl FnMut(&TransactionId, &mut O) -> bool) {
        self.outstanding.retain(keep);
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}
