//! Per-endpoint state and the transaction phase machine.
//!
//! A pipe carries at most one transfer at a time. While a transfer is active the pipe also
//! holds the register image of its next transaction, which the scheduler copies into whichever
//! slot it gets loaded into.

use smallvec::SmallVec;

use super::buffer::{LOW_SPEED_MAX_PACKET_SIZE, MAX_PACKET_SIZE};
use super::bustime;
use super::frame::Frame;
use super::queue::QueueKind;
use super::regs::{ChipPort, EpCtrl, PID_IN, PID_MASK, PID_OUT, PID_SETUP, PID_SWAP_IN_OUT};
use crate::driver_interface::{
    Callback, DeviceSpeed, HubRelation, PipeId, PipeParams, TransferRequest, TransferStatus,
};
use crate::usb::Setup;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct PipeFlags: u8 {
        /// The device went away under the pipe; new transfers are cancelled until a reset.
        const GONE = 0x01;
        /// Data toggle for the next bulk/interrupt transfer.
        const TOGGLE = 0x02;
        const LOW_SPEED = 0x04;
        const PREAMBLE = 0x08;
        /// Closed by the owner; dropped once its last callback has been delivered.
        const CLOSED = 0x10;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlPhase {
    Setup,
    Data,
    Status,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeKind {
    RootControl,
    RootInterrupt,
    Control(ControlPhase),
    Interrupt,
    Bulk,
}

impl PipeKind {
    pub fn is_root(&self) -> bool {
        matches!(self, Self::RootControl | Self::RootInterrupt)
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::Interrupt)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RootControl => "root control",
            Self::RootInterrupt => "root interrupt",
            Self::Control(ControlPhase::Setup) => "control setup",
            Self::Control(ControlPhase::Data) => "control data",
            Self::Control(ControlPhase::Status) => "control status",
            Self::Interrupt => "interrupt",
            Self::Bulk => "bulk",
        }
    }
}

/// The four per-slot registers following the control register, in chip order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransactionRegs {
    pub addr: u8,
    pub len: u8,
    pub pid: u8,
    pub dev: u8,
}

impl TransactionRegs {
    pub const fn as_array(&self) -> [u8; 4] {
        [self.addr, self.len, self.pid, self.dev]
    }

    pub const fn is_in(&self) -> bool {
        self.pid & PID_MASK == PID_IN
    }
}

pub(crate) struct Transfer<P: ChipPort> {
    pub buffer: Vec<u8>,
    pub length: usize,
    pub actual_length: usize,
    pub status: TransferStatus,
    pub setup: Option<Setup>,
    pub timeout: Option<u32>,
    pub force_short: bool,
    pub repeat: bool,
    pub callback: Callback<P>,
}

impl<P: ChipPort> From<TransferRequest<P>> for Transfer<P> {
    fn from(req: TransferRequest<P>) -> Self {
        Self {
            buffer: req.buffer,
            length: req.length,
            actual_length: 0,
            status: TransferStatus::Pending,
            setup: req.setup,
            timeout: req.timeout,
            force_short: req.force_short,
            repeat: req.repeat,
            callback: req.callback,
        }
    }
}

impl<P: ChipPort> Transfer<P> {
    /// Final status of a transfer that finished without error.
    pub fn settle(&mut self) {
        if self.status == TransferStatus::Pending {
            self.status = if self.actual_length < self.length {
                TransferStatus::Short
            } else {
                TransferStatus::Ok
            };
        }
    }

    /// Copies a root hub response into the buffer.
    pub fn respond(&mut self, data: &[u8]) {
        let len = data.len().min(self.length).min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&data[..len]);
        self.actual_length = len;
    }
}

/// Where a pipe goes after a successful transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// Another transaction of the same transfer is due this frame.
    Current,
    /// The transfer is complete.
    Callback,
}

pub(crate) struct Pipe<P: ChipPort> {
    pub id: PipeId,
    pub kind: PipeKind,
    pub device_address: u8,
    pub endpoint: u8,
    pub endpoint_in: bool,
    pub max_packet: u16,
    pub flags: PipeFlags,
    /// Polling interval in frames, zero for non-periodic pipes.
    pub interval: u32,
    /// Bus time admitted for this pipe at open.
    pub reserved_bustime: u32,
    pub transfer: Option<Transfer<P>>,

    // Scheduling image of the next transaction.
    pub regs: TransactionRegs,
    pub control: EpCtrl,
    pub bustime: u32,
    short_len: u8,
    full_len: u8,
    short_bustime: u32,
    full_bustime: u32,
    next_pid: u8,
    want_short: bool,
    pub errors: u8,
    pub frame: Frame,
    pub last_frame: Frame,
    next_frame: Option<Frame>,
    /// Offset of the current transaction's data within the transfer buffer.
    pub offset: usize,

    pub queue: Option<QueueKind>,
    pub on_timeout: bool,
}

impl<P: ChipPort> Pipe<P> {
    pub fn new(id: PipeId, kind: PipeKind, params: &PipeParams, interval: u32) -> Self {
        let mut flags = PipeFlags::empty();
        if params.speed == DeviceSpeed::Low {
            flags |= PipeFlags::LOW_SPEED;
            if params.hub == HubRelation::ExternalHub {
                flags |= PipeFlags::PREAMBLE;
            }
        }

        Self {
            id,
            kind,
            device_address: params.device_address,
            endpoint: params.endpoint.number(),
            endpoint_in: params.endpoint.address & 0x80 != 0,
            max_packet: params.endpoint.max_packet_size,
            flags,
            interval,
            reserved_bustime: 0,
            transfer: None,
            regs: TransactionRegs::default(),
            control: EpCtrl::empty(),
            bustime: 0,
            short_len: 0,
            full_len: 0,
            short_bustime: 0,
            full_bustime: 0,
            next_pid: 0,
            want_short: false,
            errors: 0,
            frame: Frame::default(),
            last_frame: Frame::default(),
            next_frame: None,
            offset: 0,
            queue: None,
            on_timeout: false,
        }
    }

    pub fn speed(&self) -> DeviceSpeed {
        if self.flags.contains(PipeFlags::LOW_SPEED) {
            DeviceSpeed::Low
        } else {
            DeviceSpeed::Full
        }
    }

    pub fn max_packet_limit(&self) -> usize {
        match self.speed() {
            DeviceSpeed::Low => LOW_SPEED_MAX_PACKET_SIZE,
            DeviceSpeed::Full => MAX_PACKET_SIZE,
        }
    }

    fn cost(&self, len: u8) -> u32 {
        bustime::cost(usize::from(len), self.speed())
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(PipeFlags::CLOSED)
    }

    /// Prepares the scheduling image for the first transaction of the pipe's transfer.
    pub fn start(&mut self, now: Frame) -> Result<(), &'static str> {
        let max_packet = usize::from(self.max_packet);
        if max_packet == 0 || max_packet > self.max_packet_limit() {
            return Err("max packet size out of range for the device speed");
        }
        let (length, force_short, setup) = match self.transfer.as_mut() {
            Some(transfer) => {
                transfer.actual_length = 0;
                (transfer.length, transfer.force_short, transfer.setup)
            }
            None => return Err("no transfer"),
        };

        self.short_len = (length % max_packet) as u8;
        self.full_len = length.min(max_packet) as u8;
        self.short_bustime = self.cost(self.short_len);
        self.full_bustime = self.cost(self.full_len);
        self.errors = 0;
        self.offset = 0;
        self.want_short = false;
        self.control = EpCtrl::ARM | EpCtrl::ENABLE;
        self.regs.dev = self.device_address;

        match self.kind {
            PipeKind::Control(_) => {
                let setup = setup.ok_or("control transfer without setup packet")?;
                self.kind = PipeKind::Control(ControlPhase::Setup);
                self.regs.pid = PID_SETUP | self.endpoint;
                self.regs.len = Setup::SIZE as u8;
                self.bustime = self.cost(Setup::SIZE as u8);
                let next_pid = if length == 0 || setup.is_read() {
                    PID_IN
                } else {
                    PID_OUT
                };
                self.next_pid = next_pid | self.endpoint;
            }
            PipeKind::Bulk | PipeKind::Interrupt => {
                let pid = if self.endpoint_in { PID_IN } else { PID_OUT };
                self.regs.pid = pid | self.endpoint;
                self.regs.len = self.full_len;
                self.bustime = self.full_bustime;
                if self.flags.contains(PipeFlags::TOGGLE) {
                    self.control |= EpCtrl::DATA_TOGGLE;
                }
                if force_short && usize::from(self.full_len) == max_packet && !self.endpoint_in {
                    self.want_short = true;
                }
            }
            PipeKind::RootControl | PipeKind::RootInterrupt => {
                return Err("root hub pipes are not scheduled");
            }
        }

        if self.kind.is_periodic() {
            self.frame = match self.next_frame.take() {
                Some(frame) if !now.is_after(frame) => frame,
                _ => now.after(self.interval),
            };
            self.last_frame = self.frame;
        }

        self.set_direction();
        if self.flags.contains(PipeFlags::PREAMBLE) {
            self.control |= EpCtrl::PREAMBLE;
        }
        Ok(())
    }

    fn set_direction(&mut self) {
        let out = !self.regs.is_in();
        self.control.set(EpCtrl::DIRECTION, out);
    }

    fn enter_status(&mut self) {
        self.kind = PipeKind::Control(ControlPhase::Status);
        self.regs.len = 0;
        self.bustime = self.cost(0);
    }

    /// Advances the phase machine after an acknowledged transaction that moved `actlen` bytes.
    pub fn on_ack(&mut self, actlen: usize) -> Disposition {
        self.errors = 0;
        match self.kind {
            PipeKind::Control(ControlPhase::Setup) => {
                self.regs.pid = self.next_pid;
                let length = self.transfer.as_ref().map_or(0, |transfer| transfer.length);
                if length > 0 {
                    self.kind = PipeKind::Control(ControlPhase::Data);
                    self.regs.len = self.full_len;
                    self.bustime = self.full_bustime;
                    self.offset = 0;
                } else {
                    self.enter_status();
                }
                // Status and first data packet are DATA1.
                self.control.insert(EpCtrl::DATA_TOGGLE);
                self.set_direction();
                Disposition::Current
            }
            PipeKind::Control(ControlPhase::Status) => Disposition::Callback,
            _ => {
                let transfer = match self.transfer.as_mut() {
                    Some(transfer) => transfer,
                    None => return Disposition::Callback,
                };
                transfer.actual_length += actlen;
                self.control.toggle(EpCtrl::DATA_TOGGLE);

                if actlen == usize::from(self.regs.len)
                    && (transfer.length > transfer.actual_length || self.want_short)
                {
                    self.offset += actlen;
                    if transfer.length - transfer.actual_length < actlen {
                        self.want_short = false;
                        self.regs.len = self.short_len;
                        self.bustime = self.short_bustime;
                    }
                    Disposition::Current
                } else if self.kind == PipeKind::Control(ControlPhase::Data) {
                    self.regs.pid ^= PID_SWAP_IN_OUT;
                    self.enter_status();
                    self.control.insert(EpCtrl::DATA_TOGGLE);
                    self.set_direction();
                    Disposition::Current
                } else {
                    if self.kind == PipeKind::Interrupt {
                        self.next_frame = Some(self.last_frame.after(self.interval));
                    }
                    self.flags
                        .set(PipeFlags::TOGGLE, self.control.contains(EpCtrl::DATA_TOGGLE));
                    Disposition::Callback
                }
            }
        }
    }

    /// Polling target after a NAK on a periodic pipe.
    pub fn defer_periodic(&mut self, now: Frame) {
        self.frame = now.after(self.interval);
        self.last_frame = self.frame;
    }

    /// Bytes to copy into the chip for the current OUT or SETUP transaction.
    pub fn out_payload(&self) -> SmallVec<[u8; MAX_PACKET_SIZE]> {
        let transfer = match self.transfer.as_ref() {
            Some(transfer) => transfer,
            None => return SmallVec::new(),
        };
        let len = usize::from(self.regs.len);
        if self.kind == PipeKind::Control(ControlPhase::Setup) {
            let setup = transfer.setup.unwrap_or_default().to_bytes();
            return SmallVec::from_slice(&setup[..len.min(Setup::SIZE)]);
        }
        let end = (self.offset + len).min(transfer.buffer.len());
        let start = self.offset.min(end);
        SmallVec::from_slice(&transfer.buffer[start..end])
    }

    pub fn persist_toggle(&mut self, toggle: bool) {
        self.flags.set(PipeFlags::TOGGLE, toggle);
    }
}
