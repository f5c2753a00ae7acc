//! Slot table tracking the submissions owned by a ring.
//!
//! Every submission added to a ring is parked in one of `2 * depth` slots
//! until its completion is observed. The slot index doubles as the ID sent to
//! the kernel and echoed back in the completion, so looking a completion up is
//! a plain array access.
//!
//! Submissions go through two states while in the table:
//!
//! - *pending*: added, with a wire record in the pending list, not yet handed
//!   to the kernel;
//! - *in flight*: handed to the kernel, completion not yet observed.

use crate::error::{Error, Result};
use crate::ring::layout::SubmissionRecord;
use crate::ring::submission::Submission;
use std::fmt;

/// Fixed-capacity registry of pending and in-flight submissions.
pub struct SlotTable {
    /// Maximum number of pending submissions.
    depth: usize,

    /// Submissions indexed by ID; `None` marks a free ID.
    slots: Box<[Option<Submission>]>,

    /// Last ID handed out; the next scan starts just past it.
    cursor: usize,

    /// Wire records of the pending submissions, oldest first.
    records: Box<[SubmissionRecord]>,

    /// Number of valid entries at the front of `records`.
    pending: usize,

    /// Submissions handed to the kernel and not completed yet.
    in_flight: usize,
}

impl SlotTable {
    /// Creates a table admitting up to `depth` pending submissions.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "slot table depth must be positive");
        let max_in_flight = depth * 2;

        Self {
            depth,
            slots: (0..max_in_flight).map(|_| None).collect(),
            cursor: max_in_flight - 1,
            records: vec![SubmissionRecord::default(); depth].into_boxed_slice(),
            pending: 0,
            in_flight: 0,
        }
    }

    /// Maximum number of pending submissions.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of IDs, i.e. the maximum of pending plus in-flight submissions.
    pub fn max_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Submissions added but not handed to the kernel yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Submissions handed to the kernel whose completion wasn't observed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// How many more submissions [`add`](Self::add) accepts right now.
    pub fn room(&self) -> usize {
        let free_ids = self.max_in_flight() - self.pending - self.in_flight;
        (self.depth - self.pending).min(free_ids)
    }

    /// Wire records of the pending submissions, oldest first.
    pub fn pending_records(&self) -> &[SubmissionRecord] {
        &self.records[..self.pending]
    }

    /// Adds a submission to the pending list and returns the ID it was given.
    ///
    /// When there is no room, the submission is handed back untouched.
    pub fn add(&mut self, mut submission: Submission) -> Result<usize, Submission> {
        if self.room() == 0 {
            return Err(submission);
        }

        let id = self.next_free_id();
        self.records[self.pending] = submission.to_record(id);
        self.slots[id] = Some(submission);
        self.pending += 1;
        Ok(id)
    }

    /// Scans for a free ID starting just past the last one handed out.
    fn next_free_id(&mut self) -> usize {
        let max = self.max_in_flight();
        for _ in 0..max {
            self.cursor = (self.cursor + 1) % max;
            if self.slots[self.cursor].is_none() {
                return self.cursor;
            }
        }

        // room() > 0 guarantees pending + in_flight < max_in_flight.
        panic!(
            "slot table exhausted: no free ID among {} (pending={}, in_flight={})",
            max, self.pending, self.in_flight
        );
    }

    /// Records that the first `count` pending submissions were handed to the
    /// kernel.
    ///
    /// The remaining ones are moved to the front of the pending list, keeping
    /// their order, to be submitted by a later call.
    pub fn on_submitted(&mut self, count: usize) {
        if count == 0 {
            return;
        }

        if count >= self.pending {
            self.in_flight += self.pending;
            self.pending = 0;
        } else {
            self.in_flight += count;
            self.records.copy_within(count..self.pending, 0);
            self.pending -= count;
        }
    }

    /// Completes the in-flight submission with the given ID.
    ///
    /// The submission's callback runs exactly once with `res`, after which the
    /// ID is free for reuse.
    pub fn on_completed(&mut self, id: i64, res: i32) -> Result<()> {
        let submission = usize::try_from(id)
            .ok()
            .and_then(|idx| self.slots.get_mut(idx))
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::Fatal(format!("completion for unknown submission id {id} (res={res})"))
            })?;

        self.in_flight = self.in_flight.saturating_sub(1);
        submission.complete(res);
        Ok(())
    }

    /// Completes every pending submission with `res` without submitting it.
    ///
    /// Returns how many submissions were completed.
    pub fn cancel_pending(&mut self, res: i32) -> usize {
        let cancelled = self.pending;
        self.pending = 0;

        for idx in 0..cancelled {
            let id = self.records[idx].id as usize;
            if let Some(submission) = self.slots[id].take() {
                submission.complete(res);
            }
        }
        cancelled
    }

    /// Forgets every submission still in the table without completing it or
    /// freeing its buffer.
    ///
    /// Used when the kernel may still write into in-flight buffers but the
    /// ring can no longer observe their completion.
    pub fn abandon(&mut self) -> usize {
        let mut abandoned = 0;
        for slot in self.slots.iter_mut() {
            if let Some(submission) = slot.take() {
                std::mem::forget(submission);
                abandoned += 1;
            }
        }
        self.pending = 0;
        self.in_flight = 0;
        abandoned
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("depth", &self.depth)
            .field("max_in_flight", &self.max_in_flight())
            .field("pending", &self.pending_records())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::buffer::IoBuf;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(u64, i32)>>>;

    /// A submission tagged by its offset that logs its completion.
    fn tagged(tag: u64, log: &Log) -> Submission {
        let log = log.clone();
        Submission::read(3, tag, IoBuf::new(8), move |res, _| {
            log.lock().unwrap().push((tag, res));
        })
        .unwrap()
    }

    fn pending_tags(table: &SlotTable) -> Vec<i64> {
        table.pending_records().iter().map(|r| r.offset).collect()
    }

    #[test]
    fn test_add_until_full() {
        let log = Log::default();
        let mut table = SlotTable::new(4);
        assert_eq!(table.max_in_flight(), 8);

        for i in 0..4 {
            assert_eq!(table.room(), 4 - i);
            assert!(table.add(tagged(i as u64, &log)).is_ok());
            assert_eq!(table.pending(), i + 1);
        }

        assert_eq!(table.room(), 0);
        let rejected = table.add(tagged(99, &log)).unwrap_err();
        assert_eq!(rejected.offset(), 99);
        assert_eq!(table.pending(), 4);
        assert_eq!(table.in_flight(), 0);
        assert_eq!(pending_tags(&table), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_partial_submit_keeps_fifo_order() {
        let log = Log::default();
        let mut table = SlotTable::new(4);
        for i in 0..4 {
            table.add(tagged(i, &log)).unwrap();
        }

        table.on_submitted(1);
        assert_eq!(table.pending(), 3);
        assert_eq!(table.in_flight(), 1);
        assert_eq!(pending_tags(&table), vec![1, 2, 3]);

        // Space freed at the tail goes to new submissions, behind the survivors.
        table.add(tagged(4, &log)).unwrap();
        assert_eq!(pending_tags(&table), vec![1, 2, 3, 4]);

        table.on_submitted(2);
        assert_eq!(pending_tags(&table), vec![3, 4]);
        assert_eq!(table.in_flight(), 3);

        table.on_submitted(10);
        assert_eq!(table.pending(), 0);
        assert_eq!(table.in_flight(), 5);
    }

    #[test]
    fn test_submit_zero_is_noop() {
        let log = Log::default();
        let mut table = SlotTable::new(2);
        table.add(tagged(0, &log)).unwrap();
        table.on_submitted(0);
        assert_eq!(table.pending(), 1);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_completion_runs_callback_once_and_frees_id() {
        let log = Log::default();
        let mut table = SlotTable::new(2);
        let first = table.add(tagged(10, &log)).unwrap();
        let second = table.add(tagged(20, &log)).unwrap();
        assert_ne!(first, second);
        table.on_submitted(2);

        table.on_completed(second as i64, 5).unwrap();
        assert_eq!(table.in_flight(), 1);
        assert_eq!(*log.lock().unwrap(), vec![(20, 5)]);

        // The slot is empty now: a second completion for the same ID is fatal.
        let err = table.on_completed(second as i64, 5).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(table.in_flight(), 1);

        assert!(table.on_completed(-1, 0).is_err());
        assert!(table.on_completed(1000, 0).is_err());
    }

    #[test]
    fn test_ids_unique_and_reused_only_after_completion() {
        let log = Log::default();
        let mut table = SlotTable::new(2);
        let mut live = HashSet::new();

        for round in 0..50u64 {
            while table.room() > 0 {
                let id = table.add(tagged(round, &log)).unwrap();
                assert!(live.insert(id), "id {id} handed out twice");
            }
            table.on_submitted(table.pending());

            // Complete the lowest live ID each round; the others stay in flight.
            let done = *live.iter().min().unwrap();
            table.on_completed(done as i64, 0).unwrap();
            live.remove(&done);

            assert_eq!(table.in_flight(), live.len());
            assert!(table.pending() + table.in_flight() <= table.max_in_flight());
        }
    }

    #[test]
    fn test_room_capped_by_free_ids() {
        let log = Log::default();
        let mut table = SlotTable::new(2);

        for _ in 0..2 {
            table.add(tagged(0, &log)).unwrap();
            table.add(tagged(0, &log)).unwrap();
            table.on_submitted(2);
        }

        // Every ID is in flight: nothing can be admitted even with no pending.
        assert_eq!(table.in_flight(), 4);
        assert_eq!(table.pending(), 0);
        assert_eq!(table.room(), 0);
        assert!(table.add(tagged(1, &log)).is_err());

        table.on_completed(0, 0).unwrap();
        assert_eq!(table.room(), 1);
        assert_eq!(table.add(tagged(1, &log)).unwrap(), 0);
    }

    #[test]
    fn test_cancel_pending() {
        let log = Log::default();
        let mut table = SlotTable::new(3);
        for i in 0..3 {
            table.add(tagged(i, &log)).unwrap();
        }
        table.on_submitted(1);

        assert_eq!(table.cancel_pending(-libc::ECANCELED), 2);
        assert_eq!(table.pending(), 0);
        assert_eq!(table.in_flight(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, -libc::ECANCELED), (2, -libc::ECANCELED)]
        );
        assert_eq!(table.room(), 3);
    }
}
