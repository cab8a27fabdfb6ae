//! Pending queue and in-flight table.

use crate::pdu::PduBuffer;
use crate::protocol::Protocol;
use hmi_common::{LinkError, LinkResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// One outstanding request.
pub struct Transaction<P: Protocol> {
    /// Non-zero transaction id.
    pub id: u16,
    /// Function code of the request.
    pub function_code: u8,
    /// Header addressing of the request.
    pub address: P::Address,
    /// Encoded payload, on loan from the link's pool.
    pub payload: PduBuffer,
    /// Listener for the reply; `None` is fire and forget.
    pub confirmation: Option<Arc<P::Confirmation>>,
    /// Issue order within the link.
    pub sequence: u64,
    /// When the frame was flushed to the transport.
    pub sent_at: Option<Instant>,
}

impl<P: Protocol> fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("function_code", &self.function_code)
            .field("address", &self.address)
            .field("payload_len", &self.payload.len())
            .field("confirmed", &self.confirmation.is_some())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Transactions waiting for a transport and transactions awaiting a reply.
pub struct TransactionTable<P: Protocol> {
    pending: VecDeque<Transaction<P>>,
    in_flight: HashMap<u16, Transaction<P>>,
}

impl<P: Protocol> Default for TransactionTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> TransactionTable<P> {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Queue a transaction until a transport exists.
    pub fn enqueue(&mut self, transaction: Transaction<P>) {
        self.pending.push_back(transaction);
    }

    /// Oldest queued transaction.
    pub fn pop_pending(&mut self) -> Option<Transaction<P>> {
        self.pending.pop_front()
    }

    /// Put back a transaction whose send failed, ahead of everything else.
    pub fn push_front_pending(&mut self, transaction: Transaction<P>) {
        self.pending.push_front(transaction);
    }

    /// Record a sent transaction.
    ///
    /// Returns the transaction it displaced if the id was still in flight,
    /// which only happens once the id space has wrapped around a reply that
    /// never came.
    pub fn mark_in_flight(&mut self, transaction: Transaction<P>) -> Option<Transaction<P>> {
        let displaced = self.in_flight.insert(transaction.id, transaction);
        if let Some(old) = &displaced {
            warn!(id = old.id, "transaction id reused while still in flight");
        }
        displaced
    }

    /// Retire the in-flight transaction answered by a reply.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::UnknownTransaction`] for late, duplicate or
    /// unsolicited replies.
    pub fn complete(&mut self, id: u16) -> LinkResult<Transaction<P>> {
        self.in_flight
            .remove(&id)
            .ok_or(LinkError::UnknownTransaction(id))
    }

    /// Remove in-flight transactions sent at least `timeout` before `now`.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Transaction<P>> {
        let expired: Vec<u16> = self
            .in_flight
            .values()
            .filter(|tx| {
                tx.sent_at
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout)
            })
            .map(|tx| tx.id)
            .collect();

        let mut taken: Vec<_> = expired
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id))
            .collect();
        taken.sort_by_key(|tx| tx.sequence);
        taken
    }

    /// Remove every in-flight transaction, oldest first.
    pub fn take_in_flight(&mut self) -> Vec<Transaction<P>> {
        let mut taken: Vec<_> = self.in_flight.drain().map(|(_, tx)| tx).collect();
        taken.sort_by_key(|tx| tx.sequence);
        taken
    }

    /// Move transactions back into the pending queue, keeping issue order.
    pub fn requeue(&mut self, transactions: Vec<Transaction<P>>) {
        for mut tx in transactions {
            tx.sent_at = None;
            self.pending.push_back(tx);
        }
        self.pending
            .make_contiguous()
            .sort_by_key(|tx| tx.sequence);
    }

    /// Empty both tables.
    pub fn drain_all(&mut self) -> Vec<Transaction<P>> {
        let mut all: Vec<_> = self.pending.drain(..).collect();
        all.extend(self.in_flight.drain().map(|(_, tx)| tx));
        all
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of transactions awaiting a reply.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if the given id is awaiting a reply.
    #[must_use]
    pub fn is_in_flight(&self, id: u16) -> bool {
        self.in_flight.contains_key(&id)
    }
}
