//! The SL811HS/T host controller.
//!
//! [`HostController`] owns the scheduler behind the interrupt lock, the pipe lock that
//! serializes pipe lifecycle operations, and the worker threads of the deferred context. Lock
//! order is always pipe lock first, then interrupt lock; a [`Bus`] is the proof of holding the
//! pipe lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};

pub mod buffer;
pub mod bustime;
mod dispatcher;
pub mod frame;
mod irq_reactor;
#[cfg(test)]
pub mod mock;
mod pipe;
mod queue;
pub mod regs;
mod root_hub;
mod scheduler;

pub use self::buffer::Slot;
pub use self::frame::Frame;
pub use self::regs::{ChipPort, ChipRevision};
pub use self::scheduler::ControllerFlags;

use self::dispatcher::{DispatchRequest, Dispatcher};
use self::irq_reactor::IrqReactor;
use self::scheduler::Scheduler;
use crate::config::{InterruptMethod, SchedulerConfig};
use crate::driver_interface::{Error, PipeId, PipeParams, Result, TransferRequest};
use crate::usb::HubPortStatus;

/// Called from the deferred context whenever a port connect or reset change is newly raised.
pub type DeviceChangeHandler = Box<dyn FnMut(HubPortStatus) + Send>;

/// Upper bound on chip events handled per `poll_now`.
const MAX_POLL_ROUNDS: usize = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HostController<P: ChipPort> {
    sched: Mutex<Scheduler<P>>,
    pipe_lock: Mutex<()>,
    config: SchedulerConfig,

    dispatch_sender: Sender<DispatchRequest>,
    // Kept here so the dispatcher, once started, can pick it up.
    dispatch_receiver: Receiver<DispatchRequest>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    irq_reactor: Mutex<Option<thread::JoinHandle<()>>>,

    device_change: Mutex<Option<DeviceChangeHandler>>,
    reset_deadline: Mutex<Option<Instant>>,
    shutdown: AtomicBool,
}

impl<P: ChipPort> HostController<P> {
    pub fn new(port: P, config: SchedulerConfig) -> Self {
        let (dispatch_sender, dispatch_receiver) = crossbeam_channel::unbounded();

        Self {
            sched: Mutex::new(Scheduler::new(port, config.clone())),
            pipe_lock: Mutex::new(()),
            config,
            dispatch_sender,
            dispatch_receiver,
            dispatcher: Mutex::new(None),
            irq_reactor: Mutex::new(None),
            device_change: Mutex::new(None),
            reset_deadline: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Probes the chip revision and marks the controller active.
    pub fn attach(&self) -> Result<ChipRevision> {
        self.with_sched(|sched| sched.attach())
    }

    /// Starts the deferred context: the dispatcher thread, or in polling mode the reactor
    /// thread that also runs the deferred work inline.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.lock_sched().flags().contains(ControllerFlags::ACTIVE) {
            return Err(Error::NotActive);
        }
        match self.config.interrupt_method {
            InterruptMethod::Irq => start_dispatcher(self),
            InterruptMethod::Polling => start_irq_reactor(self),
        }
        Ok(())
    }

    /// Stops the worker threads. Transfers still queued stay queued.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.request(DispatchRequest::Shutdown);

        let handles = [lock(&self.dispatcher).take(), lock(&self.irq_reactor).take()];
        for handle in handles.into_iter().flatten() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Takes the pipe lock. Must not be called from a completion callback; those get a `Bus`
    /// passed in.
    pub fn bus(&self) -> Bus<'_, P> {
        Bus {
            hc: self,
            _guard: lock(&self.pipe_lock),
        }
    }

    pub fn open_pipe(&self, params: &PipeParams) -> Result<PipeId> {
        self.bus().open_pipe(params)
    }

    pub fn close_pipe(&self, pipe: PipeId) -> Result<()> {
        self.bus().close_pipe(pipe)
    }

    pub fn clear_toggle(&self, pipe: PipeId) -> Result<()> {
        self.bus().clear_toggle(pipe)
    }

    pub fn submit_transfer(&self, pipe: PipeId, req: TransferRequest<P>) -> Result<()> {
        self.bus().submit_transfer(pipe, req)
    }

    pub fn abort_transfer(&self, pipe: PipeId) -> Result<()> {
        self.bus().abort_transfer(pipe)
    }

    /// Entry point for the chip's interrupt. Returns whether the chip had an event for us.
    pub fn on_hardware_event(&self) -> bool {
        self.with_sched(|sched| sched.handle_interrupt())
    }

    /// One round of polling mode: handles pending chip events and runs the deferred work.
    pub fn poll_now(&self) {
        for _ in 0..MAX_POLL_ROUNDS {
            if !self.on_hardware_event() {
                break;
            }
        }
        self.dispatch_pending();
    }

    /// Runs the deferred work queued for a dispatcher inline.
    pub fn dispatch_pending(&self) {
        while let Ok(request) = self.dispatch_receiver.try_recv() {
            match request {
                DispatchRequest::Callbacks => self.drain_callbacks(),
                DispatchRequest::PortResetTimer => self.arm_reset_timer(),
                DispatchRequest::Shutdown => (),
            }
        }
        self.finish_due_reset();
    }

    pub(crate) fn arm_reset_timer(&self) {
        *lock(&self.reset_deadline) = Some(Instant::now() + self.config.reset_delay());
    }

    pub(crate) fn reset_deadline(&self) -> Option<Instant> {
        *lock(&self.reset_deadline)
    }

    /// Completes the port reset if its deadline has passed.
    pub(crate) fn finish_due_reset(&self) {
        let expired = {
            let mut deadline = lock(&self.reset_deadline);
            let due = deadline.map_or(false, |at| Instant::now() >= at);
            if due {
                *deadline = None;
            }
            due
        };
        if expired {
            self.port_reset_timer_expired();
        }
    }

    /// Finishes a port reset once the reset pulse has lasted long enough.
    pub fn port_reset_timer_expired(&self) {
        *lock(&self.reset_deadline) = None;
        self.with_sched(|sched| sched.reset());
    }

    pub fn halt(&self) {
        self.with_sched(|sched| sched.halt());
    }

    /// Detach from the chip: halts and delivers the callbacks of everything that was pending.
    pub fn deactivate(&self) {
        info!("deactivating host controller");
        self.halt();
        self.dispatch_pending();
    }

    pub fn set_device_change_handler<F>(&self, handler: F)
    where
        F: FnMut(HubPortStatus) + Send + 'static,
    {
        *lock(&self.device_change) = Some(Box::new(handler));
    }

    pub fn frame(&self) -> Frame {
        self.lock_sched().frame()
    }

    pub fn reserved_bandwidth(&self) -> u32 {
        self.lock_sched().reserved_bustime()
    }

    pub fn port_status(&self) -> HubPortStatus {
        self.lock_sched().port_status()
    }

    pub(crate) fn lock_sched(&self) -> MutexGuard<'_, Scheduler<P>> {
        lock(&self.sched)
    }

    fn lock_device_change(&self) -> MutexGuard<'_, Option<DeviceChangeHandler>> {
        lock(&self.device_change)
    }

    /// Runs `f` under the interrupt lock, then whatever follow-up work the scheduler asks for.
    fn with_sched<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Scheduler<P>) -> T,
    {
        let mut sched = self.lock_sched();
        let result = f(&mut sched);

        if sched.has_waiting() {
            sched.admit_waiting();
            sched.try_dispatch();
        }
        if sched.schedule_deferred() {
            self.request(DispatchRequest::Callbacks);
        }
        if sched.take_reset_request() {
            self.request(DispatchRequest::PortResetTimer);
        }
        result
    }

    fn request(&self, request: DispatchRequest) {
        // The receiver lives as long as the controller, so this can't fail.
        if let Err(err) = self.dispatch_sender.send(request) {
            error!("failed to queue dispatcher request: {}", err);
        }
    }
}

/// Pipe operations, valid while the pipe lock is held.
pub struct Bus<'a, P: ChipPort> {
    hc: &'a HostController<P>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a, P: ChipPort> Bus<'a, P> {
    pub fn open_pipe(&mut self, params: &PipeParams) -> Result<PipeId> {
        self.hc.with_sched(|sched| sched.open_pipe(params))
    }

    /// Cancels the pipe's transfer, if any, and releases its bandwidth.
    pub fn close_pipe(&mut self, pipe: PipeId) -> Result<()> {
        self.hc.with_sched(|sched| sched.close_pipe(pipe))
    }

    pub fn clear_toggle(&mut self, pipe: PipeId) -> Result<()> {
        self.hc.with_sched(|sched| sched.clear_toggle(pipe))
    }

    pub fn submit_transfer(&mut self, pipe: PipeId, req: TransferRequest<P>) -> Result<()> {
        self.hc.with_sched(|sched| sched.submit(pipe, req))
    }

    pub fn abort_transfer(&mut self, pipe: PipeId) -> Result<()> {
        self.hc.with_sched(|sched| sched.abort(pipe))
    }

    pub fn frame(&self) -> Frame {
        self.hc.frame()
    }

    pub fn port_status(&self) -> HubPortStatus {
        self.hc.port_status()
    }
}

pub fn start_dispatcher<P: ChipPort>(hc: &Arc<HostController<P>>) {
    let hc_clone = Arc::clone(hc);

    debug!("About to start the dispatcher");

    *lock(&hc.dispatcher) = Some(thread::spawn(move || {
        debug!("Started dispatcher thread");
        Dispatcher::new(hc_clone).run();
    }));
}

pub fn start_irq_reactor<P: ChipPort>(hc: &Arc<HostController<P>>) {
    let hc_clone = Arc::clone(hc);

    debug!("About to start IRQ reactor");

    *lock(&hc.irq_reactor) = Some(thread::spawn(move || {
        debug!("Started IRQ reactor thread");
        IrqReactor::new(hc_clone).run();
    }));
}
