//! Register map of the SL811HS/T.
//!
//! The chip exposes 256 byte-wide registers through an address/data port pair. The first 16
//! are control registers, everything from [`BUFFER_START`] up is the shared transaction buffer.
//! Each of the two host transaction engines ("slot A" at 0x00, "slot B" at 0x08) owns five
//! registers, some of which mean different things on read and on write.

/// Base address of the slot A register bank.
pub const SLOT_A_BASE: u8 = 0x00;
/// Base address of the slot B register bank.
pub const SLOT_B_BASE: u8 = 0x08;

/// Host control register, see [`EpCtrl`].
pub const EP_CTRL: u8 = 0x00;
/// Buffer address the engine reads from or writes into.
pub const EP_ADDR: u8 = 0x01;
/// Transaction length in bytes.
pub const EP_LEN: u8 = 0x02;
/// PID (high nibble) and endpoint number (low nibble). Write only.
pub const EP_PID: u8 = 0x03;
/// Packet status, see [`EpStatus`]. Read only, aliases [`EP_PID`].
pub const EP_STATUS: u8 = 0x03;
/// Device address. Write only.
pub const EP_DEV: u8 = 0x04;
/// Bytes left over after the transaction. Read only, aliases [`EP_DEV`].
pub const EP_COUNT: u8 = 0x04;

/// Control register 1, see [`Ctrl1`].
pub const CTRL1: u8 = 0x05;
/// Interrupt enable register, see [`Interrupts`].
pub const IER: u8 = 0x06;
/// Interrupt status register. Writing a one clears the matching bit.
pub const ISR: u8 = 0x0D;
/// Hardware revision, high nibble. Read only.
pub const REV: u8 = 0x0E;
/// Low byte of the SOF interval. Write only, aliases [`REV`].
pub const SOF_LOW: u8 = 0x0E;
/// On write: high bits of the SOF interval plus [`Csof`] mode bits. On read: the SOF down
/// counter, in units of 64 full-speed bit times.
pub const CSOF: u8 = 0x0F;

/// First byte of the shared transaction buffer.
pub const BUFFER_START: u8 = 0x10;
/// One past the last byte of the shared transaction buffer.
pub const BUFFER_END: u16 = 0x100;

/// Value for [`SOF_LOW`] which, together with [`SOF_HIGH`], gives the 12000 bit time frame.
pub const SOF_LOW_VALUE: u8 = 0xE0;
/// Low six bits of [`CSOF`] on write.
pub const SOF_HIGH: u8 = 0x2E;

pub const PID_OUT: u8 = 0x10;
pub const PID_IN: u8 = 0x90;
pub const PID_SOF: u8 = 0x50;
pub const PID_SETUP: u8 = 0xD0;
pub const PID_MASK: u8 = 0xF0;
/// XOR mask turning an IN token into an OUT token and back.
pub const PID_SWAP_IN_OUT: u8 = PID_IN ^ PID_OUT;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct Ctrl1: u8 {
        const ENABLE_SOF = 0x01;
        /// Drive SE0 on the bus (USB reset).
        const RESET_ENGINE = 0x08;
        const JK_STATE = 0x10;
        const LOW_SPEED = 0x20;
        const SUSPEND = 0x40;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct Interrupts: u8 {
        const USBA = 0x01;
        const USBB = 0x02;
        const BABBLE = 0x04;
        const SOF = 0x10;
        const INSERT = 0x20;
        /// In the ISR: no device detected. In the IER: resume detection.
        const NODEV = 0x40;
        /// In the ISR: current state of D+, set when a full-speed device pulls it up.
        const DATA = 0x80;

        /// The mask programmed while a device is attached and running.
        const NORMAL = Self::USBA.bits | Self::USBB.bits | Self::SOF.bits | Self::INSERT.bits;
    }
}

impl Interrupts {
    pub fn slot_done(slot: super::buffer::Slot) -> Self {
        match slot {
            super::buffer::Slot::A => Self::USBA,
            super::buffer::Slot::B => Self::USBB,
        }
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct EpCtrl: u8 {
        const ARM = 0x01;
        const ENABLE = 0x02;
        /// Set for OUT and SETUP, clear for IN.
        const DIRECTION = 0x04;
        const ISO = 0x10;
        /// Hold the transaction until the next SOF has been sent.
        const SOF_SYNC = 0x20;
        const DATA_TOGGLE = 0x40;
        const PREAMBLE = 0x80;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct EpStatus: u8 {
        const ACK = 0x01;
        const ERROR = 0x02;
        const TIMEOUT = 0x04;
        const SEQUENCE = 0x08;
        /// Only meaningful in slave mode; never valid for a host transaction.
        const SETUP = 0x10;
        const OVERFLOW = 0x20;
        const NAK = 0x40;
        const STALL = 0x80;

        const ERRORS = Self::ERROR.bits
            | Self::TIMEOUT.bits
            | Self::SEQUENCE.bits
            | Self::SETUP.bits
            | Self::OVERFLOW.bits
            | Self::NAK.bits
            | Self::STALL.bits;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct Csof: u8 {
        /// Swap D+/D- polarity for low-speed operation.
        const POLARITY = 0x40;
        /// Generate SOF packets as the bus master.
        const MASTER = 0x80;
    }
}

/// Revision reported in the high nibble of [`REV`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChipRevision {
    Sl11h,
    Sl811hsRev12,
    Sl811hsRev15,
    Unknown(u8),
}

impl ChipRevision {
    pub fn from_register(rev: u8) -> Self {
        match rev >> 4 {
            0 => Self::Sl11h,
            1 => Self::Sl811hsRev12,
            2 => Self::Sl811hsRev15,
            other => Self::Unknown(other),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Sl811hsRev12 | Self::Sl811hsRev15)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sl11h => "SL11H",
            Self::Sl811hsRev12 => "SL811HS/T rev 1.2",
            Self::Sl811hsRev15 => "SL811HS/T rev 1.4/1.5",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Byte-wide access to the chip. How the address/data port pair is reached (ISA, PCMCIA,
/// memory mapped) is up to the implementor.
pub trait ChipPort: Send + 'static {
    fn read_reg(&mut self, addr: u8) -> u8;
    fn write_reg(&mut self, addr: u8, value: u8);

    fn read_buffer(&mut self, offset: u8, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_reg(offset.wrapping_add(i as u8));
        }
    }

    fn write_buffer(&mut self, offset: u8, buf: &[u8]) {
        for (i, byte) in buf.iter().enumerate() {
            self.write_reg(offset.wrapping_add(i as u8), *byte);
        }
    }
}
