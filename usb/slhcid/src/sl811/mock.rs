//! A register-level model of the chip for tests.
//!
//! It remembers every register write, serves the read-only registers (status, count, ISR,
//! revision, SOF counter) from separate state the test controls, and records each transaction
//! the scheduler arms.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::buffer::Slot;
use super::regs::{self, ChipPort, EpCtrl, EpStatus, Interrupts};
use crate::driver_interface::DeviceSpeed;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Armed {
    pub slot: Slot,
    pub addr: u8,
    pub len: u8,
    pub pid: u8,
    pub dev: u8,
    pub control: EpCtrl,
    pub payload: Vec<u8>,
}

impl Armed {
    pub fn toggle(&self) -> bool {
        self.control.contains(EpCtrl::DATA_TOGGLE)
    }
}

pub struct ChipState {
    /// Last value written to each address.
    pub regs: [u8; 256],
    pub status: [u8; 2],
    pub count: [u8; 2],
    /// Latched interrupt events; cleared by writing ones to the ISR.
    pub events: Interrupts,
    pub device: Option<DeviceSpeed>,
    pub revision: u8,
    pub sof_counter: u8,
    pub armed: Vec<Armed>,
}

impl Default for ChipState {
    fn default() -> Self {
        Self {
            regs: [0; 256],
            status: [0; 2],
            count: [0; 2],
            events: Interrupts::empty(),
            device: None,
            revision: 0x20,
            sof_counter: 0xBB,
            armed: Vec::new(),
        }
    }
}

impl ChipState {
    fn isr(&self) -> u8 {
        let mut isr = self.events;
        match self.device {
            None => isr |= Interrupts::NODEV,
            Some(DeviceSpeed::Full) => isr |= Interrupts::DATA,
            Some(DeviceSpeed::Low) => {}
        }
        isr.bits()
    }
}

#[derive(Clone, Default)]
pub struct MockChip {
    state: Arc<Mutex<ChipState>>,
}

impl MockChip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ChipState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn plug(&self, speed: DeviceSpeed) {
        self.state().device = Some(speed);
    }

    pub fn unplug(&self) {
        self.state().device = None;
    }

    pub fn raise(&self, events: Interrupts) {
        self.state().events |= events;
    }

    pub fn sof(&self) {
        self.raise(Interrupts::SOF);
    }

    /// Finishes the transaction in `slot` with `status`, leaving `count` bytes untransferred.
    pub fn complete(&self, slot: Slot, status: EpStatus, count: u8) {
        let mut state = self.state();
        state.status[slot.index()] = status.bits();
        state.count[slot.index()] = count;
        state.events |= Interrupts::slot_done(slot);
    }

    /// Puts device data into chip memory at `addr`, as an IN transaction would.
    pub fn fill(&self, addr: u8, data: &[u8]) {
        let mut state = self.state();
        let start = usize::from(addr);
        state.regs[start..start + data.len()].copy_from_slice(data);
    }

    pub fn take_armed(&self) -> Vec<Armed> {
        std::mem::take(&mut self.state().armed)
    }

    pub fn last_armed(&self) -> Option<Armed> {
        self.state().armed.last().cloned()
    }

    pub fn reg(&self, addr: u8) -> u8 {
        self.state().regs[usize::from(addr)]
    }
}

fn slot_of(addr: u8) -> Option<(Slot, u8)> {
    match addr {
        0x00..=0x04 => Some((Slot::A, addr)),
        0x08..=0x0C => Some((Slot::B, addr - regs::SLOT_B_BASE)),
        _ => None,
    }
}

impl ChipPort for MockChip {
    fn read_reg(&mut self, addr: u8) -> u8 {
        let state = self.state();
        match (addr, slot_of(addr)) {
            (_, Some((slot, regs::EP_STATUS))) => state.status[slot.index()],
            (_, Some((slot, regs::EP_COUNT))) => state.count[slot.index()],
            (regs::ISR, _) => state.isr(),
            (regs::REV, _) => state.revision,
            (regs::CSOF, _) => state.sof_counter,
            _ => state.regs[usize::from(addr)],
        }
    }

    fn write_reg(&mut self, addr: u8, value: u8) {
        let mut state = self.state();
        if addr == regs::ISR {
            let clear = Interrupts::from_bits_truncate(value);
            state.events.remove(clear);
            return;
        }
        state.regs[usize::from(addr)] = value;

        if let Some((slot, regs::EP_CTRL)) = slot_of(addr) {
            let control = EpCtrl::from_bits_truncate(value);
            if control.contains(EpCtrl::ARM) {
                let base = usize::from(slot.base());
                let addr = state.regs[base + usize::from(regs::EP_ADDR)];
                let len = state.regs[base + usize::from(regs::EP_LEN)];
                let start = usize::from(addr);
                let end = (start + usize::from(len)).min(256);
                let armed = Armed {
                    slot,
                    addr,
                    len,
                    pid: state.regs[base + usize::from(regs::EP_PID)],
                    dev: state.regs[base + usize::from(regs::EP_DEV)],
                    control,
                    payload: state.regs[start..end].to_vec(),
                };
                state.armed.push(armed);
            }
        }
    }
}
