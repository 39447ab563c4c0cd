//! Scripted transport for exercising drivers without hardware.
//!
//! Replies come from two places: a queue filled with [`MockAdapter::push_reply`], and
//! rules registered with [`MockAdapter::on`] that queue a reply whenever a given line is
//! written. Every written line is recorded. Clones share state, so a test can keep one
//! handle while a driver owns another.

use super::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    replies: VecDeque<String>,
    rules: HashMap<String, Vec<String>>,
    written: Vec<String>,
    fail_writes_after: Option<usize>,
    fail_reads: bool,
}

#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.state.lock().replies.push_back(reply.into());
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push_reply(reply);
        self
    }

    /// Answer with `replies` each time exactly `line` is written.
    pub fn on(&self, line: impl Into<String>, replies: &[&str]) {
        self.state
            .lock()
            .rules
            .insert(line.into(), replies.iter().map(|r| r.to_string()).collect());
    }

    /// Lines written so far, without terminators.
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().written.clear();
    }

    /// Let `count` more writes succeed, then fail every write after that.
    pub fn fail_writes_after(&self, count: usize) {
        self.state.lock().fail_writes_after = Some(count);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }
}

#[async_trait]
impl Transport for MockAdapter {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.fail_writes_after.as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("injected write failure for '{}'", line));
            }
            *remaining -= 1;
        }
        state.written.push(line.to_string());
        if let Some(replies) = state.rules.get(line).cloned() {
            state.replies.extend(replies);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(anyhow!("injected read failure"));
        }
        state
            .replies
            .pop_front()
            .ok_or_else(|| anyhow!("mock transport has no reply queued"))
    }

    async fn read_lines(&mut self, _quiet: Duration) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(anyhow!("injected read failure"));
        }
        Ok(state.replies.drain(..).collect())
    }
}
