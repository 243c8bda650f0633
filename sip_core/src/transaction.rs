use std::time::{Duration, Instant};

use crate::{Method, NextHop, Outgoing};

// Timer values from RFC 3261 (assuming UDP/unreliable transport)
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const TIMER_B: Duration = Duration::from_millis(500 * 64); // 64 * T1, also Timer F

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientTxState {
    /// Request sent, nothing heard back yet.
    Trying,
    /// A provisional response arrived.
    Proceeding,
}

#[derive(Debug, Clone)]
struct ClientTransaction {
    branch: String,
    method: Method,
    payload: String,
    hop: NextHop,
    state: ClientTxState,
    interval: Duration,
    next_retransmit: Option<Instant>,
    deadline: Instant,
}

impl ClientTransaction {
    fn matches(&self, branch: &str, method: Method) -> bool {
        self.method == method && self.branch == branch
    }

    fn on_provisional(&mut self, now: Instant) {
        self.state = ClientTxState::Proceeding;
        if self.method == Method::Invite {
            // INVITE: provisional response stops Timer A, and Timer B no longer applies.
            self.next_retransmit = None;
        } else {
            self.interval = T2;
            self.next_retransmit = Some(now + T2);
        }
    }

    fn maybe_retransmit(&mut self, now: Instant) -> Option<Outgoing> {
        let next = self.next_retransmit?;
        if now < next {
            return None;
        }

        self.interval = if self.method == Method::Invite {
            self.interval * 2
        } else {
            (self.interval * 2).min(T2)
        };
        self.next_retransmit = Some(now + self.interval);

        Some(Outgoing {
            payload: self.payload.clone(),
            next_hop: self.hop.clone(),
        })
    }

    fn expired(&self, now: Instant) -> bool {
        match (self.method, self.state) {
            (Method::Invite, ClientTxState::Proceeding) => false,
            _ => now >= self.deadline,
        }
    }
}

/// A request that got no final response before Timer B/F fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTimeout {
    pub branch: String,
    pub method: Method,
}

/// Retransmission and timeout bookkeeping for the requests we send.
#[derive(Debug, Default)]
pub struct ClientTransactions {
    transactions: Vec<ClientTransaction>,
}

impl ClientTransactions {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
        }
    }

    /// Track a request that was just sent. ACK is never tracked.
    pub fn start(&mut self, branch: &str, method: Method, outgoing: &Outgoing, now: Instant) {
        if method == Method::Ack {
            return;
        }
        self.transactions.retain(|t| !t.matches(branch, method));
        self.transactions.push(ClientTransaction {
            branch: branch.to_string(),
            method,
            payload: outgoing.payload.clone(),
            hop: outgoing.next_hop.clone(),
            state: ClientTxState::Trying,
            interval: T1,
            next_retransmit: Some(now + T1),
            deadline: now + TIMER_B,
        });
    }

    /// Feed a response. Returns false when it matches no live transaction
    /// (a stray or retransmitted final response).
    pub fn on_response(&mut self, branch: &str, method: Method, status: u16, now: Instant) -> bool {
        let Some(pos) = self
            .transactions
            .iter()
            .position(|t| t.matches(branch, method))
        else {
            return false;
        };

        if status < 200 {
            self.transactions[pos].on_provisional(now);
        } else {
            self.transactions.remove(pos);
        }
        true
    }

    /// Forget a transaction without reporting a timeout.
    pub fn abandon(&mut self, branch: &str, method: Method) {
        self.transactions.retain(|t| !t.matches(branch, method));
    }

    /// Advance timers: returns retransmissions to send now and the
    /// transactions that timed out (already removed).
    pub fn poll(&mut self, now: Instant) -> (Vec<Outgoing>, Vec<TransactionTimeout>) {
        let mut timeouts = Vec::new();
        self.transactions.retain(|t| {
            if t.expired(now) {
                timeouts.push(TransactionTimeout {
                    branch: t.branch.clone(),
                    method: t.method,
                });
                false
            } else {
                true
            }
        });

        let retransmits = self
            .transactions
            .iter_mut()
            .filter_map(|t| t.maybe_retransmit(now))
            .collect();

        (retransmits, timeouts)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }
}
