//! The transaction scheduler.
//!
//! All state that the interrupt path touches lives in [`Scheduler`], which the host controller
//! keeps behind its interrupt lock. Nothing in here blocks or calls back into user code: finished
//! transfers are parked on the callback queue and handed to the dispatcher through
//! [`Scheduler::pop_deferred`].
//!
//! Only one of the two engines is ever armed at a time, since starting both corrupts data on
//! every chip revision. The second slot is still useful: the next transaction is loaded into it
//! while the first one is on the wire, and IN data is copied out of a finished slot after the
//! next transaction has been armed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;

use super::buffer::Slot;
use super::bustime;
use super::frame::Frame;
use super::pipe::{ControlPhase, Disposition, Pipe, PipeFlags, PipeKind, TransactionRegs, Transfer};
use super::queue::{QueueKind, Queues};
use super::regs::{self, ChipPort, ChipRevision, Csof, Ctrl1, EpCtrl, EpStatus, Interrupts};
use crate::config::SchedulerConfig;
use crate::driver_interface::{
    ConsistencyViolation, DeviceSpeed, EndpointTy, Error, HubRelation, PipeId, PipeParams,
    TransferRequest, TransferStatus,
};
use crate::usb::HubPortStatus;

/// Interrupt calls without any pending event after which the IER is read back and verified.
const IER_CHECK_INTERVAL: u32 = 100;

/// Address of the root hub's status change endpoint.
pub const ROOT_INTR_ENDPOINT: u8 = 0x81;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct ControllerFlags: u32 {
        const ACTIVE = 1 << 0;
        const NO_DEVICE = 1 << 1;
        const LOW_SPEED = 1 << 2;
        /// Reset pulse on the wire, waiting for the reset timer.
        const RESET = 1 << 3;
        const USB_DISABLED = 1 << 4;
        const C_CONNECT = 1 << 5;
        const C_RESET = 1 << 6;
        const ROOT_INTR = 1 << 7;
        const POWER = 1 << 8;
        const REAL_POWER = 1 << 9;
        /// A dispatcher request is outstanding.
        const CALLBACK = 1 << 10;
        const SOF_CHECK1 = 1 << 11;
        const SOF_CHECK2 = 1 << 12;
        const ISOC_WARNED = 1 << 13;
        const LSVH_WARNED = 1 << 14;

        const DISABLED = Self::NO_DEVICE.bits | Self::USB_DISABLED.bits;
        const CHANGE = Self::C_CONNECT.bits | Self::C_RESET.bits;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Idle,
    /// Registers programmed, waiting for enough bus time to arm.
    Ready,
    InProgress,
}

impl Default for SlotState {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SlotTracker {
    /// `None` with a length set means the owner was aborted, or it is the SOF primed by reset.
    pub pipe: Option<PipeId>,
    /// Set while the slot's buffer region is in use, including IN copy-out.
    pub len: Option<u8>,
    pub state: SlotState,
}

impl SlotTracker {
    fn is_free(&self) -> bool {
        self.len.is_none()
    }
}

/// Lets a warning through at most once per interval.
pub(crate) struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Work for the deferred context.
pub(crate) enum Deferred<P: ChipPort> {
    DeviceChange(HubPortStatus),
    Transfer(PipeId, Transfer<P>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Requeue {
    Current,
    NextFrame,
    Timed,
    Callback,
}

pub(crate) struct Scheduler<P: ChipPort> {
    pub(super) port: P,
    pub(super) config: SchedulerConfig,
    pub(super) flags: ControllerFlags,
    pub(super) frame: Frame,
    pub(super) slots: [SlotTracker; 2],
    /// What the chip's slot registers currently hold.
    slot_regs: [TransactionRegs; 2],
    pub(super) ier: Interrupts,
    ier_checks: u32,
    pub(super) reserved_bustime: u32,
    pub(super) root_address: u8,
    pub(super) root_config: u8,
    pub(super) root_intr: Option<PipeId>,
    pub(super) pipes: BTreeMap<PipeId, Pipe<P>>,
    next_pipe_id: u32,
    pub(super) queues: Queues,
    pub(super) reset_requested: bool,
    notified_changes: ControllerFlags,
    overtime_warning: RateLimit,
    overflow_warning: RateLimit,
}

impl<P: ChipPort> Scheduler<P> {
    pub fn new(port: P, config: SchedulerConfig) -> Self {
        let warning_interval = config.warning_interval();
        Self {
            port,
            config,
            flags: ControllerFlags::NO_DEVICE | ControllerFlags::USB_DISABLED,
            frame: Frame::default(),
            slots: Default::default(),
            slot_regs: Default::default(),
            ier: Interrupts::empty(),
            ier_checks: 0,
            reserved_bustime: 0,
            root_address: 0,
            root_config: 0,
            root_intr: None,
            pipes: BTreeMap::new(),
            next_pipe_id: 1,
            queues: Queues::default(),
            reset_requested: false,
            notified_changes: ControllerFlags::empty(),
            overtime_warning: RateLimit::new(warning_interval),
            overflow_warning: RateLimit::new(warning_interval),
        }
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn flags(&self) -> ControllerFlags {
        self.flags
    }

    pub fn reserved_bustime(&self) -> u32 {
        self.reserved_bustime
    }

    pub(super) fn read(&mut self, addr: u8) -> u8 {
        self.port.read_reg(addr)
    }

    pub(super) fn write(&mut self, addr: u8, value: u8) {
        trace!("write {:#04x} <- {:#04x}", addr, value);
        self.port.write_reg(addr, value);
    }

    pub(super) fn set_interrupts(&mut self, ier: Interrupts) {
        if self.ier != ier {
            self.ier = ier;
            self.write(regs::IER, ier.bits());
        }
    }

    pub fn attach(&mut self) -> Result<ChipRevision, Error> {
        let raw = self.read(regs::REV);
        let revision = ChipRevision::from_register(raw);
        if !revision.is_supported() {
            error!("{} unsupported or bus error (revision {:#04x})", revision.name(), raw);
            return Err(Error::UnsupportedChip(raw >> 4));
        }

        info!(
            "ScanLogic {} USB host controller, max current {} mA",
            revision.name(),
            u32::from(self.config.max_current) * 2
        );
        self.flags
            .insert(ControllerFlags::REAL_POWER | ControllerFlags::ACTIVE);
        Ok(revision)
    }

    fn live_pipe(&mut self, id: PipeId) -> Result<&mut Pipe<P>, Error> {
        self.pipes
            .get_mut(&id)
            .filter(|pipe| !pipe.is_closed())
            .ok_or(Error::NoSuchPipe)
    }

    pub fn open_pipe(&mut self, params: &PipeParams) -> Result<PipeId, Error> {
        let endpoint = params.endpoint;

        let (kind, interval) = if params.device_address == self.root_address {
            match endpoint.address {
                0 => (PipeKind::RootControl, 0),
                ROOT_INTR_ENDPOINT => (PipeKind::RootInterrupt, 1),
                _ => return Err(Error::Invalid("invalid root hub endpoint")),
            }
        } else {
            if self.flags.intersects(ControllerFlags::DISABLED) {
                return Err(Error::Disabled);
            }
            if params.speed == DeviceSpeed::Low
                && params.hub == HubRelation::ExternalHub
                && !self.config.try_low_speed_via_hub
            {
                if !self.flags.contains(ControllerFlags::LSVH_WARNED) {
                    self.flags.insert(ControllerFlags::LSVH_WARNED);
                    warn!("low speed device behind a hub is not supported");
                }
                return Err(Error::Invalid("low speed device behind a hub"));
            }
            let limit = match params.speed {
                DeviceSpeed::Low => super::buffer::LOW_SPEED_MAX_PACKET_SIZE,
                DeviceSpeed::Full => super::buffer::MAX_PACKET_SIZE,
            };
            if usize::from(endpoint.max_packet_size) > limit {
                debug!(
                    "max packet size {} too large for device {}",
                    endpoint.max_packet_size, params.device_address
                );
                return Err(Error::Invalid("max packet size too large"));
            }
            match endpoint.ty() {
                EndpointTy::Ctrl => (PipeKind::Control(ControlPhase::Setup), 0),
                EndpointTy::Bulk => (PipeKind::Bulk, 0),
                EndpointTy::Interrupt => (PipeKind::Interrupt, u32::from(endpoint.interval.max(1))),
                EndpointTy::Isoch => {
                    if !self.flags.contains(ControllerFlags::ISOC_WARNED) {
                        self.flags.insert(ControllerFlags::ISOC_WARNED);
                        warn!("isochronous transfers are not supported");
                    }
                    return Err(Error::Invalid("isochronous transfers are not supported"));
                }
            }
        };

        let reserved = if kind.is_periodic() {
            let cost = bustime::cost(usize::from(endpoint.max_packet_size), params.speed);
            self.reserve_bandwidth(cost)?;
            cost
        } else {
            0
        };

        let id = PipeId(self.next_pipe_id);
        self.next_pipe_id += 1;
        let mut pipe = Pipe::new(id, kind, params, interval);
        pipe.reserved_bustime = reserved;
        self.pipes.insert(id, pipe);

        debug!(
            "{}: opened {} pipe to device {} endpoint {:#04x}, interval {}",
            id,
            kind.name(),
            params.device_address,
            endpoint.address,
            interval
        );
        Ok(id)
    }

    pub fn close_pipe(&mut self, id: PipeId) -> Result<(), Error> {
        self.live_pipe(id)?;
        self.cancel(id, TransferStatus::Cancelled);

        let (reserved, pending) = match self.pipes.get_mut(&id) {
            Some(pipe) => {
                let pending = pipe.queue == Some(QueueKind::Callback);
                if pending {
                    pipe.flags.insert(PipeFlags::CLOSED);
                }
                (std::mem::take(&mut pipe.reserved_bustime), pending)
            }
            None => return Err(Error::NoSuchPipe),
        };
        if reserved > 0 {
            self.release_bandwidth(reserved);
        }
        if !pending {
            self.pipes.remove(&id);
        }
        debug!("{}: closed", id);
        Ok(())
    }

    pub fn clear_toggle(&mut self, id: PipeId) -> Result<(), Error> {
        let pipe = self.live_pipe(id)?;
        if pipe.transfer.is_some() && pipe.queue != Some(QueueKind::Callback) {
            self.fatal(ConsistencyViolation::ToggleClearedInFlight);
            return Err(Error::Busy);
        }
        pipe.persist_toggle(false);
        Ok(())
    }

    pub fn toggle(&self, id: PipeId) -> Option<bool> {
        self.pipes
            .get(&id)
            .map(|pipe| pipe.flags.contains(PipeFlags::TOGGLE))
    }

    pub fn reserve_bandwidth(&mut self, cost: u32) -> Result<(), Error> {
        let committed = self.reserved_bustime;
        let limit = self.config.reserved_bustime;
        if committed + cost > limit {
            if self.config.overtime_is_error {
                return Err(Error::BandwidthExceeded {
                    requested: cost,
                    committed,
                    limit,
                });
            }
            if self.overtime_warning.check() {
                warn!(
                    "periodic bandwidth overcommitted: {} + {} > {} bit times",
                    committed, cost, limit
                );
            }
        }
        self.reserved_bustime = committed + cost;
        Ok(())
    }

    pub fn release_bandwidth(&mut self, cost: u32) {
        if cost > self.reserved_bustime {
            warn!(
                "releasing {} bit times with only {} reserved",
                cost, self.reserved_bustime
            );
            self.reserved_bustime = 0;
        } else {
            self.reserved_bustime -= cost;
        }
    }

    pub fn submit(&mut self, id: PipeId, req: TransferRequest<P>) -> Result<(), Error> {
        let disabled = self.flags.intersects(ControllerFlags::DISABLED);
        let now = self.frame;
        let pipe = self.live_pipe(id)?;
        if pipe.transfer.is_some() {
            return Err(Error::Busy);
        }
        if req.length > req.buffer.len() {
            return Err(Error::Invalid("transfer length exceeds the buffer"));
        }
        let kind = pipe.kind;
        match kind {
            PipeKind::RootControl | PipeKind::Control(_) if req.setup.is_none() => {
                return Err(Error::Invalid("control transfer without setup packet"));
            }
            PipeKind::RootControl | PipeKind::RootInterrupt => (),
            _ if disabled => return Err(Error::Disabled),
            _ => (),
        }

        trace!("{}: submit {:?}", id, req);
        pipe.transfer = Some(Transfer::from(req));

        match kind {
            PipeKind::RootControl => self.root_control(id),
            PipeKind::RootInterrupt => self.arm_root_interrupt(id),
            _ => {
                if let Err(reason) = pipe.start(now) {
                    debug!("{}: {}", id, reason);
                    if let Some(transfer) = pipe.transfer.as_mut() {
                        transfer.status = TransferStatus::Invalid;
                    }
                }
                let busy = self
                    .slots
                    .iter()
                    .any(|slot| slot.state == SlotState::InProgress);
                if busy {
                    self.enqueue(id, QueueKind::Wait);
                } else {
                    self.enter_schedule(id);
                    self.try_dispatch();
                }
            }
        }
        Ok(())
    }

    pub fn abort(&mut self, id: PipeId) -> Result<(), Error> {
        self.live_pipe(id)?;
        self.cancel(id, TransferStatus::Cancelled);
        Ok(())
    }

    fn enqueue(&mut self, id: PipeId, kind: QueueKind) {
        let pipe = match self.pipes.get_mut(&id) {
            Some(pipe) => pipe,
            None => return,
        };
        if let Some(old) = pipe.queue.take() {
            self.queues.remove(old, id);
        }
        match kind {
            QueueKind::Wait => self.queues.wait.push_back(id),
            QueueKind::Current => self.queues.current.push_back(id),
            QueueKind::Next => self.queues.next.push_back(id),
            QueueKind::Timed => self.queues.timed.insert(pipe.frame, id),
            QueueKind::Callback => self.queues.callback.push_back(id),
        }
        pipe.queue = Some(kind);
    }

    /// Moves a transfer to the callback queue, settling its status if it is still pending.
    pub(super) fn finish(&mut self, id: PipeId) {
        let pipe = match self.pipes.get_mut(&id) {
            Some(pipe) => pipe,
            None => return,
        };
        if pipe.on_timeout {
            self.queues.timeout.remove(id);
            pipe.on_timeout = false;
        }
        if let Some(transfer) = pipe.transfer.as_mut() {
            transfer.settle();
            debug!(
                "{}: {} transfer finished: {}, {} of {} bytes",
                id,
                pipe.kind.name(),
                transfer.status,
                transfer.actual_length,
                transfer.length
            );
        }
        self.enqueue(id, QueueKind::Callback);
    }

    /// Takes a transfer away from the hardware and every queue and fails it with `status`.
    fn cancel(&mut self, id: PipeId, status: TransferStatus) {
        let pipe = match self.pipes.get_mut(&id) {
            Some(pipe) => pipe,
            None => return,
        };
        if pipe.queue == Some(QueueKind::Callback) {
            return;
        }
        let transfer = match pipe.transfer.as_mut() {
            Some(transfer) => transfer,
            None => return,
        };
        transfer.status = status;
        if let Some(kind) = pipe.queue.take() {
            self.queues.remove(kind, id);
        }

        for tracker in self.slots.iter_mut() {
            if tracker.pipe == Some(id) {
                tracker.pipe = None;
                if tracker.state != SlotState::InProgress {
                    *tracker = SlotTracker::default();
                }
            }
        }
        if self.root_intr == Some(id) {
            self.root_intr = None;
        }
        debug!("{}: cancelled with {}", id, status);
        self.finish(id);
    }

    /// Places a submitted transfer on the schedule, or straight on the callback queue if it
    /// can't run.
    fn enter_schedule(&mut self, id: PipeId) {
        let disabled = self.flags.intersects(ControllerFlags::DISABLED);
        let now = self.frame;
        let pipe = match self.pipes.get_mut(&id) {
            Some(pipe) => pipe,
            None => return,
        };
        let gone = pipe.flags.contains(PipeFlags::GONE);
        let periodic = pipe.kind.is_periodic();
        let transfer = match pipe.transfer.as_mut() {
            Some(transfer) => transfer,
            None => return,
        };
        if (disabled || gone) && transfer.status == TransferStatus::Pending {
            debug!("{}: controller disabled or device gone", id);
            transfer.status = TransferStatus::Cancelled;
        }
        if transfer.status != TransferStatus::Pending {
            self.finish(id);
            return;
        }

        if let Some(timeout) = transfer.timeout {
            self.queues.timeout.insert(now.after(timeout.max(1)), id);
            pipe.on_timeout = true;
        }
        if periodic {
            self.enqueue(id, QueueKind::Timed);
        } else {
            self.enqueue(id, QueueKind::Current);
        }
    }

    pub fn has_waiting(&self) -> bool {
        !self.queues.wait.is_empty()
    }

    pub fn admit_waiting(&mut self) {
        while let Some(id) = self.queues.wait.pop_front() {
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.queue = None;
            }
            self.enter_schedule(id);
        }
    }

    /// Loads queued transactions into free slots.
    pub fn try_dispatch(&mut self) {
        loop {
            if self.flags.intersects(ControllerFlags::DISABLED) {
                break;
            }
            let slot = match Slot::ALL
                .iter()
                .copied()
                .find(|slot| self.slots[slot.index()].is_free())
            {
                Some(slot) => slot,
                None => break,
            };
            let id = match self.queues.timed.pop_due(self.frame) {
                Some(id) => id,
                None => match self.queues.current.pop_front() {
                    Some(id) => id,
                    None => break,
                },
            };
            self.load(slot, id);
        }
        self.start_ready();
    }

    fn load(&mut self, slot: Slot, id: PipeId) {
        let (regs, payload) = match self.pipes.get_mut(&id) {
            Some(pipe) if pipe.transfer.is_some() => {
                pipe.queue = None;
                pipe.regs.addr = slot.payload_offset(pipe.regs.len);
                let payload = if pipe.regs.len > 0 && !pipe.regs.is_in() {
                    Some(pipe.out_payload())
                } else {
                    None
                };
                (pipe.regs, payload)
            }
            _ => return,
        };

        if let Some(payload) = payload {
            self.port.write_buffer(regs.addr, &payload);
        }

        let base = slot.base();
        let old = self.slot_regs[slot.index()];
        let new = regs.as_array();
        for (i, (new, old)) in new.iter().zip(old.as_array().iter()).enumerate() {
            // The address is meaningless without data.
            if i == 0 && regs.len == 0 {
                continue;
            }
            if new != old {
                self.write(base + regs::EP_ADDR + i as u8, *new);
            }
        }
        let mut current = regs;
        if regs.len == 0 {
            current.addr = old.addr;
        }
        self.slot_regs[slot.index()] = current;

        self.slots[slot.index()] = SlotTracker {
            pipe: Some(id),
            len: Some(regs.len),
            state: SlotState::Ready,
        };
        trace!(
            "{}: loaded into slot {:?}: addr {:#04x} len {} pid {:#04x} dev {}",
            id,
            slot,
            regs.addr,
            regs.len,
            regs.pid,
            regs.dev
        );
    }

    /// Arms a loaded slot if nothing is in progress and the frame has room for it.
    fn start_ready(&mut self) {
        if self.flags.intersects(ControllerFlags::DISABLED) {
            return;
        }
        if self
            .slots
            .iter()
            .any(|slot| slot.state == SlotState::InProgress)
        {
            return;
        }
        if !self.slots.iter().any(|slot| slot.state == SlotState::Ready) {
            return;
        }

        let remaining = i64::from(bustime::remaining_from_counter(self.read(regs::CSOF)))
            - i64::from(self.config.end_bustime());

        for slot in Slot::ALL {
            let tracker = self.slots[slot.index()];
            if tracker.state != SlotState::Ready {
                continue;
            }
            let (bustime, control) = match tracker.pipe.and_then(|id| self.pipes.get(&id)) {
                Some(pipe) => (pipe.bustime, pipe.control),
                None => {
                    self.slots[slot.index()] = SlotTracker::default();
                    continue;
                }
            };
            if remaining >= i64::from(bustime) {
                self.slots[slot.index()].state = SlotState::InProgress;
                self.flags
                    .remove(ControllerFlags::SOF_CHECK1 | ControllerFlags::SOF_CHECK2);
                self.write(slot.base() + regs::EP_CTRL, control.bits());
                trace!("slot {:?} armed, control {:?}", slot, control);
                return;
            }
        }
    }

    /// Interrupt entry. Returns whether the chip had anything for us.
    pub fn handle_interrupt(&mut self) -> bool {
        if self.ier.is_empty() {
            return false;
        }
        let raw = self.read(regs::ISR);

        self.ier_checks += 1;
        if self.ier_checks > IER_CHECK_INTERVAL {
            self.ier_checks = 0;
            let ier = self.read(regs::IER);
            if ier != self.ier.bits() {
                self.fatal(ConsistencyViolation::InterruptMaskCorrupted);
                return true;
            }
        }

        let isr = Interrupts::from_bits_truncate(raw) & self.ier;
        if isr.is_empty() {
            return false;
        }
        self.ier_checks = 0;
        self.write(regs::ISR, isr.bits());

        if isr.contains(Interrupts::INSERT) {
            self.on_insertion_change();
            return true;
        }

        if isr.contains(Interrupts::SOF) && !self.on_frame_tick() {
            return true;
        }

        let mut done = isr & (Interrupts::USBA | Interrupts::USBB);
        if done == Interrupts::USBA | Interrupts::USBB {
            let a = self.slots[Slot::A.index()].state == SlotState::InProgress;
            let b = self.slots[Slot::B.index()].state == SlotState::InProgress;
            match (a, b) {
                (true, false) => done = Interrupts::USBA,
                (false, true) => done = Interrupts::USBB,
                _ => {
                    debug!("both slots reported done with {} in progress", a as u8 + b as u8);
                    self.try_dispatch();
                    return true;
                }
            }
            warn!("both slots reported done, keeping {:?}", done);
        }

        for slot in Slot::ALL {
            if !done.contains(Interrupts::slot_done(slot)) {
                continue;
            }
            if self.slots[slot.index()].state != SlotState::InProgress {
                self.fatal(ConsistencyViolation::CompletionNotArmed);
                return true;
            }
            self.slots[slot.index()].state = SlotState::Idle;
            self.start_ready();
            self.on_transaction_done(slot);
            if !self.flags.contains(ControllerFlags::ACTIVE) {
                return true;
            }
        }

        self.try_dispatch();
        true
    }

    /// Start of a new frame. Returns false if the controller had to be halted.
    fn on_frame_tick(&mut self) -> bool {
        self.frame = self.frame.next();

        for id in self.queues.next.iter() {
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.queue = Some(QueueKind::Current);
            }
        }
        self.queues.merge_next();

        if self
            .slots
            .iter()
            .any(|slot| slot.state == SlotState::InProgress)
        {
            if self.flags.contains(ControllerFlags::SOF_CHECK2) {
                self.fatal(ConsistencyViolation::MissedCompletion);
                return false;
            } else if self.flags.contains(ControllerFlags::SOF_CHECK1) {
                self.flags.insert(ControllerFlags::SOF_CHECK2);
            } else {
                self.flags.insert(ControllerFlags::SOF_CHECK1);
            }
        }

        if self.flags.intersects(ControllerFlags::CHANGE) {
            self.flags.insert(ControllerFlags::ROOT_INTR);
        }

        let mut expired: SmallVec<[PipeId; 4]> = SmallVec::new();
        while let Some(id) = self.queues.timeout.pop_due(self.frame) {
            expired.push(id);
        }
        for id in expired {
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.on_timeout = false;
            }
            debug!("{}: deadline passed in frame {}", id, self.frame);
            self.cancel(id, TransferStatus::Timeout);
        }

        self.start_ready();
        true
    }

    fn on_transaction_done(&mut self, slot: Slot) {
        let index = slot.index();
        // The owner stays on the slot until the outcome is known, so a halt can still cancel it.
        let id = match self.slots[index].pipe {
            Some(id) => id,
            None => {
                self.slots[index].len = None;
                return;
            }
        };
        let (regs, offset) = match self.pipes.get(&id) {
            Some(pipe) if pipe.transfer.is_some() => (pipe.regs, pipe.offset),
            _ => {
                self.slots[index].len = None;
                return;
            }
        };

        let base = slot.base();
        let status = EpStatus::from_bits_truncate(self.read(base + regs::EP_STATUS));
        if status.is_empty() {
            self.fatal(ConsistencyViolation::NoStatus);
            return;
        }

        let mut actlen = 0;
        if !status.intersects(EpStatus::ERRORS) {
            let count = self.read(base + regs::EP_COUNT);
            if count > regs.len {
                error!("{}: {} bytes left of {}", id, count, regs.len);
                self.fatal(ConsistencyViolation::CountExceedsLength);
                return;
            }
            actlen = usize::from(regs.len - count);
        }
        trace!("{}: slot {:?} done, status {:?}, {} bytes", id, slot, status, actlen);

        let copy = if actlen > 0 && regs.is_in() {
            Some((regs.addr, offset, actlen))
        } else {
            None
        };

        let errors = status & EpStatus::ERRORS;
        if errors.contains(EpStatus::SETUP) {
            self.fatal(ConsistencyViolation::SetupStatusBit);
            return;
        }
        self.slots[index].pipe = None;

        let now = self.frame;
        let max_retries = self.config.max_retries;
        let pipe = match self.pipes.get_mut(&id) {
            Some(pipe) => pipe,
            None => return,
        };
        let requeue = if errors.is_empty() {
            match pipe.on_ack(actlen) {
                Disposition::Current => Requeue::Current,
                Disposition::Callback => Requeue::Callback,
            }
        } else if errors == EpStatus::NAK {
            if pipe.kind.is_periodic() {
                pipe.defer_periodic(now);
                Requeue::Timed
            } else {
                Requeue::NextFrame
            }
        } else {
            pipe.errors = pipe.errors.saturating_add(1);
            if pipe.errors > max_retries || errors.contains(EpStatus::STALL) {
                let failed = if errors.contains(EpStatus::STALL) {
                    TransferStatus::Stalled
                } else {
                    TransferStatus::IoError
                };
                debug!("{}: giving up after {} errors, {:?}", id, pipe.errors, errors);
                if let Some(transfer) = pipe.transfer.as_mut() {
                    transfer.status = failed;
                }
                if errors.contains(EpStatus::OVERFLOW) && self.overflow_warning.check() {
                    warn!("{}: overflow condition, data corruption possible", id);
                }
                Requeue::Callback
            } else {
                Requeue::NextFrame
            }
        };

        match requeue {
            Requeue::Current => self.enqueue(id, QueueKind::Current),
            Requeue::NextFrame => self.enqueue(id, QueueKind::Next),
            Requeue::Timed => self.enqueue(id, QueueKind::Timed),
            Requeue::Callback => self.finish(id),
        }

        if let Some((addr, offset, actlen)) = copy {
            // The region stays reserved, so the next transaction goes to the other slot.
            self.try_dispatch();
            if let Some(transfer) = self
                .pipes
                .get_mut(&id)
                .and_then(|pipe| pipe.transfer.as_mut())
            {
                let end = (offset + actlen).min(transfer.buffer.len());
                if let Some(target) = transfer.buffer.get_mut(offset..end) {
                    self.port.read_buffer(addr, target);
                }
            }
        }

        self.slots[index].len = None;
    }

    pub fn fatal(&mut self, reason: ConsistencyViolation) {
        error!("{}, halting controller", reason);
        self.halt();
    }

    /// Stops all hardware activity and cancels everything. Only a new attach brings the
    /// controller back.
    pub fn halt(&mut self) {
        self.set_interrupts(Interrupts::empty());
        self.flags.remove(ControllerFlags::ACTIVE);
        self.flags.insert(ControllerFlags::USB_DISABLED);
        if !self.flags.contains(ControllerFlags::NO_DEVICE) {
            self.flags.insert(
                ControllerFlags::NO_DEVICE | ControllerFlags::C_CONNECT | ControllerFlags::ROOT_INTR,
            );
        }
        self.drain();

        self.reserved_bustime = 0;
        for pipe in self.pipes.values_mut() {
            pipe.reserved_bustime = 0;
        }
        info!("controller halted");
    }

    /// Cancels every transfer that is loaded or queued and marks all pipes gone.
    pub(super) fn drain(&mut self) {
        let mut drained: SmallVec<[PipeId; 8]> = SmallVec::new();
        for tracker in self.slots.iter_mut() {
            if let Some(id) = tracker.pipe {
                drained.push(id);
            }
            *tracker = SlotTracker::default();
        }
        drained.extend(self.queues.wait.iter());
        drained.extend(self.queues.current.iter());
        drained.extend(self.queues.next.iter());
        drained.extend(self.queues.timed.drain());
        self.queues.wait = Default::default();
        self.queues.current = Default::default();
        self.queues.next = Default::default();
        self.queues.timeout.clear();

        for pipe in self.pipes.values_mut() {
            pipe.on_timeout = false;
            if pipe.kind.is_root() {
                continue;
            }
            pipe.flags.insert(PipeFlags::GONE);
            if pipe.queue != Some(QueueKind::Callback) {
                pipe.queue = None;
            }
            if let Some(transfer) = pipe.transfer.as_mut() {
                transfer.repeat = false;
            }
        }

        if !drained.is_empty() {
            debug!("draining {} transfers", drained.len());
        }
        for id in drained {
            if let Some(transfer) = self
                .pipes
                .get_mut(&id)
                .and_then(|pipe| pipe.transfer.as_mut())
            {
                if transfer.status == TransferStatus::Pending {
                    transfer.status = TransferStatus::Cancelled;
                }
            }
            self.finish(id);
        }

        self.flags.insert(ControllerFlags::USB_DISABLED);
        self.flags.remove(ControllerFlags::LOW_SPEED);
    }

    fn on_insertion_change(&mut self) {
        if self.flags.contains(ControllerFlags::NO_DEVICE) {
            info!("device inserted");
            self.set_interrupts(Interrupts::empty());
        } else {
            info!("device removed");
            self.drain();
            self.set_interrupts(Interrupts::INSERT);
        }
        self.flags.toggle(ControllerFlags::NO_DEVICE);
        self.flags
            .insert(ControllerFlags::ROOT_INTR | ControllerFlags::C_CONNECT);
    }

    /// Second half of a port reset, once the reset pulse has lasted long enough.
    pub fn reset(&mut self) {
        if !self.flags.contains(ControllerFlags::RESET) {
            return;
        }
        if !self.flags.contains(ControllerFlags::ACTIVE) {
            self.flags.remove(ControllerFlags::RESET);
            return;
        }

        self.write(regs::CTRL1, 0);
        self.write(regs::ISR, 0xFF);
        let isr = Interrupts::from_bits_truncate(self.read(regs::ISR));
        if isr.contains(Interrupts::INSERT) {
            self.write(regs::ISR, Interrupts::INSERT.bits());
        }

        if isr.contains(Interrupts::NODEV) {
            info!("port reset: no device");
            if !self.flags.contains(ControllerFlags::NO_DEVICE) {
                self.flags.insert(
                    ControllerFlags::C_CONNECT
                        | ControllerFlags::ROOT_INTR
                        | ControllerFlags::NO_DEVICE,
                );
            }
            self.set_interrupts(Interrupts::INSERT);
        } else {
            if self.flags.contains(ControllerFlags::NO_DEVICE) {
                self.flags.insert(ControllerFlags::C_CONNECT);
            }
            self.flags
                .remove(ControllerFlags::NO_DEVICE | ControllerFlags::LOW_SPEED);

            let (polarity, ctrl) = if isr.contains(Interrupts::DATA) {
                info!("port reset: full speed device");
                (Csof::empty(), Ctrl1::empty())
            } else {
                info!("port reset: low speed device");
                self.flags.insert(ControllerFlags::LOW_SPEED);
                (Csof::POLARITY, Ctrl1::LOW_SPEED)
            };

            // Writing CSOF restarts the chip's frame counter.
            self.frame = Frame::default();
            self.write(regs::SOF_LOW, regs::SOF_LOW_VALUE);
            self.write(regs::CSOF, (polarity | Csof::MASTER).bits() | regs::SOF_HIGH);
            self.write(regs::CTRL1, (ctrl | Ctrl1::ENABLE_SOF).bits());

            // Slot A sends one SOF packet to get the engine going; slot B just gets sane
            // values.
            let a = TransactionRegs {
                addr: regs::BUFFER_START,
                len: 0,
                pid: regs::PID_SOF,
                dev: 0,
            };
            let b = TransactionRegs {
                addr: (regs::BUFFER_END - 8) as u8,
                len: 0,
                pid: 0,
                dev: 0,
            };
            for (slot, image) in [(Slot::A, a), (Slot::B, b)] {
                for (i, value) in image.as_array().iter().enumerate() {
                    self.write(slot.base() + regs::EP_ADDR + i as u8, *value);
                }
                self.slot_regs[slot.index()] = image;
            }
            self.write(Slot::A.base() + regs::EP_CTRL, EpCtrl::ARM.bits());
            self.slots[Slot::A.index()] = SlotTracker {
                pipe: None,
                len: Some(0),
                state: SlotState::InProgress,
            };
            self.slots[Slot::B.index()] = SlotTracker::default();

            self.set_interrupts(Interrupts::NORMAL);
        }

        self.flags
            .remove(ControllerFlags::USB_DISABLED | ControllerFlags::RESET);
        self.flags
            .insert(ControllerFlags::C_RESET | ControllerFlags::ROOT_INTR);
        for pipe in self.pipes.values_mut() {
            pipe.flags.remove(PipeFlags::GONE);
        }
    }

    pub fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    fn fresh_changes(&self) -> ControllerFlags {
        let pending = self.flags & ControllerFlags::CHANGE;
        pending - (self.notified_changes & pending)
    }

    pub fn has_deferred(&self) -> bool {
        !self.queues.callback.is_empty()
            || (self.flags.contains(ControllerFlags::ROOT_INTR) && self.root_intr.is_some())
            || !self.fresh_changes().is_empty()
    }

    /// Marks the dispatcher as requested. True if the caller has to send the request.
    pub fn schedule_deferred(&mut self) -> bool {
        if self.flags.contains(ControllerFlags::CALLBACK) || !self.has_deferred() {
            return false;
        }
        self.flags.insert(ControllerFlags::CALLBACK);
        true
    }

    /// Next piece of work for the dispatcher. Returning `None` ends the dispatcher's turn.
    pub fn pop_deferred(&mut self) -> Option<Deferred<P>> {
        self.notified_changes &= self.flags & ControllerFlags::CHANGE;
        let fresh = self.fresh_changes();
        if !fresh.is_empty() {
            self.notified_changes |= fresh;
            return Some(Deferred::DeviceChange(self.port_status()));
        }

        if self.flags.contains(ControllerFlags::ROOT_INTR) && self.root_intr.is_some() {
            self.flags.remove(ControllerFlags::ROOT_INTR);
            self.complete_root_interrupt();
        }

        while let Some(id) = self.queues.callback.pop_front() {
            let pipe = match self.pipes.get_mut(&id) {
                Some(pipe) => pipe,
                None => continue,
            };
            pipe.queue = None;
            let transfer = match pipe.transfer.take() {
                Some(transfer) => transfer,
                None => continue,
            };
            if pipe.is_closed() {
                self.pipes.remove(&id);
            }
            return Some(Deferred::Transfer(id, transfer));
        }

        self.flags.remove(ControllerFlags::CALLBACK);
        None
    }

    pub fn port_status(&self) -> HubPortStatus {
        let mut status = HubPortStatus::empty();
        status.set(
            HubPortStatus::CONNECTION,
            !self.flags.contains(ControllerFlags::NO_DEVICE),
        );
        status.set(
            HubPortStatus::ENABLE,
            !self.flags.contains(ControllerFlags::USB_DISABLED),
        );
        status.set(HubPortStatus::RESET, self.flags.contains(ControllerFlags::RESET));
        status.set(HubPortStatus::POWER, self.flags.contains(ControllerFlags::POWER));
        status.set(
            HubPortStatus::LOW_SPEED,
            self.flags.contains(ControllerFlags::LOW_SPEED),
        );
        status.set(
            HubPortStatus::CONNECTION_CHANGED,
            self.flags.contains(ControllerFlags::C_CONNECT),
        );
        status.set(
            HubPortStatus::RESET_CHANGED,
            self.flags.contains(ControllerFlags::C_RESET),
        );
        status
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, slot: Slot) -> SlotTracker {
        self.slots[slot.index()]
    }

    #[cfg(test)]
    pub(crate) fn queue_of(&self, id: PipeId) -> Option<QueueKind> {
        self.pipes.get(&id).and_then(|pipe| pipe.queue)
    }

    #[cfg(test)]
    pub(crate) fn timed_frame(&self, id: PipeId) -> Option<Frame> {
        self.queues.timed.frame_of(id)
    }

    #[cfg(test)]
    pub(crate) fn has_pipe(&self, id: PipeId) -> bool {
        self.pipes.contains_key(&id)
    }
}
