//! The deferred context: completion callbacks, the device change notification and the port
//! reset timer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, trace};

use super::scheduler::Deferred;
use super::{ChipPort, HostController};
use crate::driver_interface::{Completion, TransferRequest, TransferStatus};

pub enum DispatchRequest {
    /// The callback queue became non-empty, or a port change is pending.
    Callbacks,
    /// A port reset pulse was started; finish it once the reset delay has passed.
    PortResetTimer,
    Shutdown,
}

pub struct Dispatcher<P: ChipPort> {
    hc: Arc<HostController<P>>,
    request_queue: Receiver<DispatchRequest>,
}

impl<P: ChipPort> Dispatcher<P> {
    pub fn new(hc: Arc<HostController<P>>) -> Self {
        let request_queue = hc.dispatch_receiver.clone();
        Self { hc, request_queue }
    }

    /// Serves requests until shutdown. A pending port reset is finished from the receive
    /// timeout, so callbacks keep flowing during the reset pulse.
    pub fn run(&mut self) {
        loop {
            let received = match self.hc.reset_deadline() {
                Some(at) => self
                    .request_queue
                    .recv_timeout(at.saturating_duration_since(Instant::now())),
                None => self
                    .request_queue
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            let request = match received {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    self.hc.finish_due_reset();
                    continue;
                }
                Err(err) => {
                    error!("dispatcher request queue closed: {}", err);
                    break;
                }
            };
            match request {
                DispatchRequest::Callbacks => self.hc.drain_callbacks(),
                DispatchRequest::PortResetTimer => self.hc.arm_reset_timer(),
                DispatchRequest::Shutdown => {
                    debug!("dispatcher shutting down");
                    break;
                }
            }
            // A busy queue never times out.
            self.hc.finish_due_reset();
        }
    }
}

impl<P: ChipPort> HostController<P> {
    /// Delivers everything the scheduler has parked for the deferred context. Callbacks run
    /// with the pipe lock held and the interrupt lock released.
    pub(crate) fn drain_callbacks(&self) {
        let mut bus = self.bus();

        loop {
            let deferred = self.lock_sched().pop_deferred();
            match deferred {
                None => break,
                Some(Deferred::DeviceChange(status)) => {
                    debug!("port status change: {:?}", status);
                    let mut handler = self.lock_device_change();
                    if let Some(handler) = handler.as_mut() {
                        if panic::catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
                            error!("device change handler panicked");
                        }
                    }
                }
                Some(Deferred::Transfer(id, mut transfer)) => {
                    let completion = Completion {
                        pipe: id,
                        status: transfer.status,
                        actual_length: transfer.actual_length,
                        buffer: std::mem::take(&mut transfer.buffer),
                    };
                    trace!("{}: callback with {}", id, completion.status);
                    let callback = &mut transfer.callback;
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&mut bus, &completion)))
                        .is_err()
                    {
                        // Dropped, never resubmitted.
                        error!("{}: completion callback panicked", id);
                        continue;
                    }

                    if !transfer.repeat
                        || matches!(
                            completion.status,
                            TransferStatus::Cancelled | TransferStatus::Invalid
                        )
                    {
                        continue;
                    }
                    let req = TransferRequest {
                        buffer: completion.buffer,
                        length: transfer.length,
                        setup: transfer.setup,
                        timeout: transfer.timeout,
                        force_short: transfer.force_short,
                        repeat: true,
                        callback: transfer.callback,
                    };
                    if let Err(err) = bus.submit_transfer(id, req) {
                        debug!("{}: not resubmitted: {}", id, err);
                    }
                }
            }
        }

        // Admits whatever the callbacks submitted while a slot was busy.
        self.with_sched(|_| ());
    }
}
