//! Request ids and send instants for in-flight `step` requests.
//!
//! Responses on one connection arrive in request order, so when the
//! response for id `r` arrives every older id is known to be lost and is
//! retired with it. The table is also capped so a server that never
//! answers cannot grow it without bound.

use std::collections::BTreeMap;
use std::time::Instant;

use simlink_types::RequestId;
use tracing::debug;

/// Default cap on in-flight `step` requests.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Correlation table for `step` requests.
#[derive(Debug)]
pub struct PendingRequests {
    next: u64,
    pending: BTreeMap<RequestId, Instant>,
    max_pending: usize,
    abandoned: u64,
}

impl PendingRequests {
    /// Create an empty table holding at most `max_pending` entries.
    ///
    /// A cap of zero is treated as one.
    pub fn new(max_pending: usize) -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            abandoned: 0,
        }
    }

    /// Assign the next id and remember when it was sent.
    ///
    /// Evicts the oldest entry when the table is full.
    pub fn issue(&mut self, sent_at: Instant) -> RequestId {
        let rid = RequestId(self.next);
        self.next = self.next.saturating_add(1);

        while self.pending.len() >= self.max_pending {
            if let Some((oldest, _)) = self.pending.pop_first() {
                self.abandoned = self.abandoned.saturating_add(1);
                debug!(rid = %oldest, "Pending table full, evicting oldest request");
            }
        }
        self.pending.insert(rid, sent_at);
        rid
    }

    /// Retire `rid` and every older id.
    ///
    /// Returns the send instant of `rid`, or `None` if it is not pending.
    pub fn complete(&mut self, rid: RequestId) -> Option<Instant> {
        let sent_at = self.pending.remove(&rid)?;
        let newer = self.pending.split_off(&rid);
        let older = std::mem::replace(&mut self.pending, newer);
        if !older.is_empty() {
            let count = u64::try_from(older.len()).unwrap_or(u64::MAX);
            self.abandoned = self.abandoned.saturating_add(count);
            debug!(rid = %rid, retired = count, "Retired unanswered older requests");
        }
        Some(sent_at)
    }

    /// Forget `rid` without retiring anything else (e.g. its send failed).
    pub fn cancel(&mut self, rid: RequestId) -> bool {
        self.pending.remove(&rid).is_some()
    }

    /// Whether `rid` is awaiting a response.
    pub fn contains(&self, rid: RequestId) -> bool {
        self.pending.contains_key(&rid)
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is awaiting a response.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Requests retired without a response so far.
    pub const fn abandoned(&self) -> u64 {
        self.abandoned
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut table = PendingRequests::default();
        let now = Instant::now();
        let ids: Vec<u64> = (0..4).map(|_| table.issue(now).into_inner()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn completion_removes_exactly_once() {
        let mut table = PendingRequests::default();
        let sent = Instant::now();
        let rid = table.issue(sent);

        assert_eq!(table.complete(rid), Some(sent));
        assert_eq!(table.complete(rid), None);
        assert!(table.is_empty());
    }

    #[test]
    fn completion_retires_older_ids() {
        let mut table = PendingRequests::default();
        let now = Instant::now();
        let first = table.issue(now);
        let second = table.issue(now);
        let third = table.issue(now);
        let fourth = table.issue(now);

        assert!(table.complete(third).is_some());
        assert!(!table.contains(first));
        assert!(!table.contains(second));
        assert!(table.contains(fourth));
        assert_eq!(table.abandoned(), 2);

        // A late answer for a retired id is not correlated.
        assert_eq!(table.complete(first), None);
    }

    #[test]
    fn unknown_ids_leave_table_untouched() {
        let mut table = PendingRequests::default();
        let rid = table.issue(Instant::now());
        assert_eq!(table.complete(RequestId(99)), None);
        assert!(table.contains(rid));
    }

    #[test]
    fn cap_evicts_oldest() {
        let mut table = PendingRequests::new(2);
        let base = Instant::now();
        let a = table.issue(base);
        let b = table.issue(base);
        let c = table.issue(base);

        assert_eq!(table.len(), 2);
        assert!(!table.contains(a));
        assert!(table.contains(b) && table.contains(c));
        assert_eq!(table.abandoned(), 1);
    }

    #[test]
    fn cancel_does_not_retire_others() {
        let mut table = PendingRequests::default();
        let now = Instant::now();
        let a = table.issue(now);
        let b = table.issue(now);
        assert!(table.cancel(b));
        assert!(table.contains(a));
        assert_eq!(table.abandoned(), 0);
    }
}
