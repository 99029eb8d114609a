//! Layout of the 240 byte shared transaction buffer.
//!
//! Each transaction engine gets a fixed half of the buffer. Slot A payloads start at the
//! bottom of region A, slot B payloads end at the top of region B, so a transaction loaded
//! into one slot can never overwrite data still owned by the other.

use super::regs::{self, BUFFER_END, BUFFER_START};

/// Largest max packet size the scheduler accepts (full-speed bulk/interrupt/control).
pub const MAX_PACKET_SIZE: usize = 64;
/// Largest max packet size for low-speed devices.
pub const LOW_SPEED_MAX_PACKET_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    pub start: u16,
    pub end: u16,
}

impl Region {
    pub const fn len(&self) -> usize {
        (self.end - self.start) as usize
    }
}

const MIDDLE: u16 = BUFFER_START as u16 + (BUFFER_END - BUFFER_START as u16) / 2;

pub const REGION_A: Region = Region {
    start: BUFFER_START as u16,
    end: MIDDLE,
};
pub const REGION_B: Region = Region {
    start: MIDDLE,
    end: BUFFER_END,
};

const _: () = assert!(REGION_A.end <= REGION_B.start);
const _: () = assert!(REGION_A.len() >= MAX_PACKET_SIZE);
const _: () = assert!(REGION_B.len() >= MAX_PACKET_SIZE);
const _: () = assert!(REGION_A.len() + REGION_B.len() == 240);

/// One of the two host transaction engines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    pub const fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub const fn base(self) -> u8 {
        match self {
            Slot::A => regs::SLOT_A_BASE,
            Slot::B => regs::SLOT_B_BASE,
        }
    }

    pub const fn region(self) -> Region {
        match self {
            Slot::A => REGION_A,
            Slot::B => REGION_B,
        }
    }

    /// Chip buffer address of a `len` byte payload loaded into this slot.
    pub fn payload_offset(self, len: u8) -> u8 {
        let region = self.region();
        let len = u16::from(len).min(region.end - region.start);
        let offset = match self {
            Slot::A => region.start,
            Slot::B if len == 0 => region.start,
            Slot::B => region.end - len,
        };
        offset as u8
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions_split_evenly() {
        assert_eq!(REGION_A, Region { start: 0x10, end: 0x88 });
        assert_eq!(REGION_B, Region { start: 0x88, end: 0x100 });
    }

    #[test]
    fn payload_offsets_stay_in_region() {
        assert_eq!(Slot::A.payload_offset(64), 0x10);
        assert_eq!(Slot::B.payload_offset(64), 0xC0);
        assert_eq!(Slot::B.payload_offset(22), 0xEA);
        assert_eq!(Slot::B.payload_offset(0), 0x88);

        for len in 0..=MAX_PACKET_SIZE as u8 {
            for slot in Slot::ALL {
                let offset = u16::from(slot.payload_offset(len));
                let region = slot.region();
                assert!(offset >= region.start);
                assert!(offset + u16::from(len) <= region.end);
            }
        }
    }
}
