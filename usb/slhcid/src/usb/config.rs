#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    /// Maximum current drawn from the bus, in 2 mA units.
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

impl ConfigDescriptor {
    pub const SIZE: u8 = 9;

    /// Reserved bit that USB 1.1 requires to be set.
    pub const ATTR_ONE: u8 = 0x80;
    pub const ATTR_SELF_POWERED: u8 = 0x40;
    pub const ATTR_REMOTE_WAKEUP: u8 = 0x20;
}
