//! Table of outbound requests awaiting their response.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::oneshot;

use super::SessionError;

/// Response frame delivered to a waiting caller.
#[derive(Debug)]
pub(crate) struct InboundResponse {
    /// Type id from the response frame header.
    pub(crate) type_id: i32,
    /// Encoded response envelope.
    pub(crate) envelope: Vec<u8>,
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    entries: HashMap<String, oneshot::Sender<InboundResponse>>,
}

/// Pending request table.
///
/// Registration and closing share one lock, so a request registered after
/// the connection dropped is refused rather than left waiting.
#[derive(Default)]
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `request_identifier` and return the receiving half.
    pub(crate) fn register(
        &self,
        request_identifier: &str,
    ) -> Result<oneshot::Receiver<InboundResponse>, SessionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SessionError::Terminated);
        }
        let (tx, rx) = oneshot::channel();
        state.entries.insert(request_identifier.to_owned(), tx);
        Ok(rx)
    }

    /// Forget `request_identifier` without completing it.
    pub(crate) fn remove(&self, request_identifier: &str) {
        self.lock().entries.remove(request_identifier);
    }

    /// Hand `response` to the caller waiting on `request_identifier`.
    ///
    /// Returns `false` when nobody is waiting any more: the identifier is
    /// unknown, or its caller stopped listening.
    pub(crate) fn complete(&self, request_identifier: &str, response: InboundResponse) -> bool {
        let sender = self.lock().entries.remove(request_identifier);
        sender.is_some_and(|tx| tx.send(response).is_ok())
    }

    /// Refuse further registrations and fail every waiting caller.
    ///
    /// Returns the number of callers that were still waiting.
    pub(crate) fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        drained.len()
    }

    /// Number of requests still awaiting a response.
    pub(crate) fn len(&self) -> usize { self.lock().entries.len() }
}

/// Removes its entry from the table when the waiting caller goes away.
pub(crate) struct PendingEntry<'a> {
    table: &'a PendingRequests,
    request_identifier: String,
    receiver: oneshot::Receiver<InboundResponse>,
}

impl<'a> PendingEntry<'a> {
    pub(crate) fn new(table: &'a PendingRequests, request_identifier: String) -> Result<Self, SessionError> {
        let receiver = table.register(&request_identifier)?;
        Ok(Self {
            table,
            request_identifier,
            receiver,
        })
    }

    /// Wait for the response; fails with [`SessionError::Disconnected`] if the
    /// table is closed first.
    pub(crate) async fn wait(mut self) -> Result<InboundResponse, SessionError> {
        (&mut self.receiver)
            .await
            .map_err(|_| SessionError::Disconnected)
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) { self.table.remove(&self.request_identifier); }
}
