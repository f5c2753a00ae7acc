//! In-memory provider for deterministic tests.
//!
//! Reads are served from a byte vector. How many records each call accepts
//! and how many completions it releases can be capped to reproduce partial
//! submission and out-of-order reaping.

use crate::error::{Error, Result};
use crate::provider::{FileOps, NativeProvider, RingBackend};
use crate::ring::{CompletionBatch, RingConfig, SubmissionRecord};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
pub(crate) struct ScriptState {
    /// File content served to reads.
    pub content: Vec<u8>,
    /// Maximum records taken per call; unlimited when `None`.
    pub accept_per_call: Option<usize>,
    /// Maximum completions released per call; unlimited when `None`.
    pub complete_per_call: Option<usize>,
    /// Result reported for every read instead of the byte count.
    pub result_override: Option<i32>,
    /// Reports more submissions than were offered.
    pub over_report: bool,
    /// Fails the next call with a fatal error.
    pub fail_next: bool,
    /// Completions for unknown IDs reported, once, ahead of the real ones.
    pub bogus_completions: Vec<(i64, i32)>,
    /// Accepted but not yet released completions, oldest first.
    pub held: VecDeque<(i64, i32)>,
    /// Every record accepted so far.
    pub seen: Vec<SubmissionRecord>,
    /// Number of submit-and-check calls.
    pub calls: usize,
    /// Number of destroy calls.
    pub destroyed: usize,
    /// Value returned by open.
    pub open_result: i32,
    /// Value returned by close.
    pub close_result: i32,
    /// Arguments of every open.
    pub opened: Vec<(PathBuf, bool, bool)>,
    /// Descriptors passed to close.
    pub closed: Vec<i32>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            content: Vec::new(),
            accept_per_call: None,
            complete_per_call: None,
            result_override: None,
            over_report: false,
            fail_next: false,
            bogus_completions: Vec::new(),
            held: VecDeque::new(),
            seen: Vec::new(),
            calls: 0,
            destroyed: 0,
            open_result: 3,
            close_result: 0,
            opened: Vec::new(),
            closed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedProvider {
    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        let provider = Self::default();
        provider.state().content = content.into();
        provider
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn shared(&self) -> Arc<dyn NativeProvider> {
        Arc::new(self.clone())
    }
}

impl NativeProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create_ring(
        &self,
        _config: &RingConfig,
    ) -> Result<(Box<dyn RingBackend>, Arc<dyn FileOps>)> {
        Ok((Box::new(self.clone()), Arc::new(self.clone())))
    }
}

impl RingBackend for ScriptedProvider {
    fn submit_and_check_completions(
        &mut self,
        records: &[SubmissionRecord],
        batch: &mut CompletionBatch,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_next {
            state.fail_next = false;
            return Err(Error::Fatal("scripted failure".into()));
        }

        let accept = state.accept_per_call.unwrap_or(usize::MAX).min(records.len());
        for record in &records[..accept] {
            let res = match state.result_override {
                Some(res) => res,
                None if record.is_read => {
                    let start = (record.offset as usize).min(state.content.len());
                    let end = (start + record.buf_length as usize).min(state.content.len());
                    let src = &state.content[start..end];
                    // Safety: the record points at a live buffer of at least
                    // `buf_length` bytes owned by the slot table.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.as_ptr(), record.buf_base, src.len());
                    }
                    src.len() as i32
                }
                None => record.buf_length,
            };
            state.held.push_back((record.id, res));
            state.seen.push(*record);
        }
        let reported = if state.over_report { records.len() + 1 } else { accept };
        batch.set_submitted(reported);

        for (id, res) in std::mem::take(&mut state.bogus_completions) {
            batch.push(id, res);
        }

        let release = state.complete_per_call.unwrap_or(usize::MAX);
        for _ in 0..release {
            if batch.is_full() {
                break;
            }
            match state.held.pop_front() {
                Some((id, res)) => {
                    batch.push(id, res);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.state().destroyed += 1;
    }
}

impl FileOps for ScriptedProvider {
    fn open_file(&self, path: &Path, read_only: bool, direct_io: bool) -> i32 {
        let mut state = self.state();
        state.opened.push((path.to_path_buf(), read_only, direct_io));
        state.open_result
    }

    fn close_file(&self, fd: i32) -> i32 {
        let mut state = self.state();
        state.closed.push(fd);
        state.close_result
    }
}
