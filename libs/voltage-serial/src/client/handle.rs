//! Producer side of the client loop
//!
//! Other tasks queue writes and raw requests through a cloned
//! [`ClientHandle`]. Every producer call wakes the loop through one
//! [`Notify`]; a permit stored while the loop is busy makes the next wait
//! return at once, so no signal is lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::debug;

use super::rpc::{PendingRpc, RawRequest};
use crate::error::{Result, SerialError};
use crate::register::Register;

#[derive(Debug, Default)]
pub(crate) struct Shared {
    writes: Mutex<Vec<(Arc<Register>, u64)>>,
    rpcs: Mutex<VecDeque<PendingRpc>>,
    notify: Notify,
}

impl Shared {
    /// Wait for a signal or the deadline; true when signaled
    pub(crate) async fn wait(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.notify.notified() => true,
            _ = sleep_until(deadline) => false,
        }
    }

    pub(crate) fn take_writes(&self) -> Vec<(Arc<Register>, u64)> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub(crate) fn take_rpcs(&self) -> VecDeque<PendingRpc> {
        std::mem::take(&mut *self.rpcs.lock())
    }
}

/// Cloneable handle for queueing work from other tasks
#[derive(Debug, Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queue a write of `text`, converted with the register format.
    ///
    /// A later value for the same register replaces a queued one.
    pub fn set_text_value(&self, register: &Arc<Register>, text: &str) -> Result<()> {
        let config = register.config();
        if config.read_only {
            return Err(SerialError::not_supported(format!(
                "{register} is read only"
            )));
        }
        let raw = config.to_raw(text)?;
        debug!("set {} = {} ({:#x})", register, text, raw);
        self.shared.writes.lock().push((Arc::clone(register), raw));
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Send raw bytes on the port and wait for the raw response.
    ///
    /// Fails with a timeout when the loop does not answer within
    /// `request.total_timeout`.
    pub async fn transceive(&self, request: RawRequest) -> Result<Vec<u8>> {
        let total_timeout = request.total_timeout;
        let (reply, response) = oneshot::channel();
        self.shared.rpcs.lock().push_back(PendingRpc { request, reply });
        self.shared.notify.notify_one();

        match timeout(total_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SerialError::session("client stopped before answering")),
            Err(_) => Err(SerialError::timeout("RPC request timed out")),
        }
    }
}
