//! Scripted in-memory port
//!
//! Replies are either queued up front or produced by a responder closure
//! that sees every written request. Clones share state, so a test keeps
//! one clone for inspection and hands the other to the client.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

use super::{FrameCompletePredicate, Port};
use crate::error::{Result, SerialError};

/// One scripted reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Frame(Vec<u8>),
    /// Nothing arrives; the read fails after the response timeout
    Silence,
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    fail_skip_noise: bool,
    open_calls: usize,
    skip_noise_calls: usize,
    replies: VecDeque<MockReply>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    last_interaction: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockPort")
            .field("open", &state.open)
            .field("queued", &state.replies.len())
            .field("written", &state.written.len())
            .finish()
    }
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, frame: impl Into<Vec<u8>>) {
        self.state.lock().replies.push_back(MockReply::Frame(frame.into()));
    }

    pub fn push_silence(&self) {
        self.state.lock().replies.push_back(MockReply::Silence);
    }

    /// Answer every write with the closure result, `None` means silence
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn set_fail_skip_noise(&self, fail: bool) {
        self.state.lock().fail_skip_noise = fail;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub fn skip_noise_calls(&self) -> usize {
        self.state.lock().skip_noise_calls
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }
}

#[async_trait]
impl Port for MockPort {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.fail_open {
            return Err(SerialError::port("mock port refused to open"));
        }
        if state.open {
            return Err(SerialError::port("mock port already open"));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.open = false;
        state.replies.clear();
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.written.push(buf.to_vec());
        state.last_interaction = Some(Instant::now());
        let state = &mut *state;
        if let Some(responder) = state.responder.as_mut() {
            let reply = match responder(buf) {
                Some(frame) => MockReply::Frame(frame),
                None => MockReply::Silence,
            };
            state.replies.push_back(reply);
        }
        Ok(())
    }

    async fn read_frame(
        &mut self,
        max_len: usize,
        response_timeout: Duration,
        _frame_timeout: Duration,
        _frame_complete: Option<&FrameCompletePredicate>,
    ) -> Result<Vec<u8>> {
        self.check_open()?;
        let reply = self.state.lock().replies.pop_front();
        match reply {
            Some(MockReply::Frame(mut frame)) => {
                if frame.len() > max_len {
                    let rest = frame.split_off(max_len);
                    self.state.lock().replies.push_front(MockReply::Frame(rest));
                }
                self.state.lock().last_interaction = Some(Instant::now());
                Ok(frame)
            },
            Some(MockReply::Silence) | None => {
                sleep(response_timeout).await;
                Err(SerialError::timeout("request timed out"))
            },
        }
    }

    async fn skip_noise(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.skip_noise_calls += 1;
        if state.fail_skip_noise {
            return Err(SerialError::io("mock noise never ends"));
        }
        state.replies.clear();
        Ok(())
    }

    async fn sleep_since_last_interaction(&mut self, delay: Duration) {
        let last = self.state.lock().last_interaction;
        if let Some(last) = last {
            sleep_until(last + delay).await;
        }
    }

    fn description(&self) -> String {
        "<mock>".to_string()
    }
}
