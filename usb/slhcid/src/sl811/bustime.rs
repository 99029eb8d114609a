//! Worst-case bus time of USB 1.1 transactions, in full-speed bit times.
//!
//! The constants follow the bandwidth approximation of the USB 1.1 specification (section
//! 5.9.3), including protocol overhead and bit stuffing of the data phase.

use crate::driver_interface::DeviceSpeed;

/// A frame lasts 1 ms, or 12000 full-speed bit times.
pub const FRAME_BUSTIME: u32 = 12000;

/// Protocol overhead of a full-speed non-isochronous transaction.
pub const FULL_SPEED_OVERHEAD: u32 = 114;
/// Protocol overhead of a full-speed isochronous IN transaction.
pub const FULL_SPEED_ISOC_IN_OVERHEAD: u32 = 92;
/// Protocol overhead of a full-speed isochronous OUT transaction.
pub const FULL_SPEED_ISOC_OUT_OVERHEAD: u32 = 80;
/// Worst case of the two isochronous overheads.
pub const FULL_SPEED_ISOC_OVERHEAD: u32 = 92;
/// Protocol overhead of a low-speed transaction, preamble included.
pub const LOW_SPEED_OVERHEAD: u32 = 804;

/// 42 bit times of EOF plus 20 of hub skew, rounded up to the 64 bit time granularity of the
/// chip's SOF counter.
pub const END_OF_FRAME_RESERVE: u32 = 128;

/// Bit stuffed data phase of `len` bytes at full speed.
pub const fn full_speed_data_time(len: u32) -> u32 {
    (len << 3) + len + (len >> 1)
}

/// Bit stuffed data phase of `len` bytes at low speed, scaled to full-speed bit times.
pub const fn low_speed_data_time(len: u32) -> u32 {
    (len << 6) + (len << 4)
}

/// Worst-case bus time of a single transaction carrying `len` bytes.
pub fn cost(len: usize, speed: DeviceSpeed) -> u32 {
    let len = len as u32;
    match speed {
        DeviceSpeed::Full => FULL_SPEED_OVERHEAD + full_speed_data_time(len),
        DeviceSpeed::Low => LOW_SPEED_OVERHEAD + low_speed_data_time(len),
    }
}

pub const fn end_of_frame_reserve() -> u32 {
    END_OF_FRAME_RESERVE
}

/// Bus time left in the current frame according to the chip's SOF down counter.
pub fn remaining_from_counter(csof: u8) -> u32 {
    u32::from(csof) << 6
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_speed_costs() {
        assert_eq!(cost(0, DeviceSpeed::Full), 114);
        assert_eq!(cost(8, DeviceSpeed::Full), 114 + 76);
        assert_eq!(cost(64, DeviceSpeed::Full), 722);
    }

    #[test]
    fn low_speed_costs() {
        assert_eq!(cost(0, DeviceSpeed::Low), 804);
        assert_eq!(cost(8, DeviceSpeed::Low), 804 + 640);
    }

    #[test]
    fn counter_granularity() {
        assert_eq!(remaining_from_counter(0xBB), 11968);
        assert!(remaining_from_counter(0xBB) <= FRAME_BUSTIME);
        assert_eq!(remaining_from_counter(2), end_of_frame_reserve());
    }
}
