/// Hub descriptor of a USB 1.1 hub with up to seven ports, so that the removable and power
/// control bitmaps are a single byte each. See USB 1.1 section 11.15.2.1.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptor {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    /// Time from power on until power is good on a port, in 2 ms units.
    pub power_on_good: u8,
    /// Maximum current the hub controller itself draws, in mA.
    pub current: u8,
    pub device_removable: u8,
    pub port_power_control_mask: u8,
}

unsafe impl plain::Plain for HubDescriptor {}

impl HubDescriptor {
    pub const DESCRIPTOR_KIND: u8 = 0x29;
    pub const SIZE: u8 = 9;
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct HubCharacteristics: u16 {
        /// Ganged power switching is all bits clear.
        const POWER_INDIVIDUAL = 0x0001;
        const POWER_NONE = 0x0002;
        const COMPOUND = 0x0004;
        /// Global over-current protection is all bits clear.
        const OVER_CURRENT_INDIVIDUAL = 0x0008;
        const OVER_CURRENT_NONE = 0x0010;
    }
}

/// Port features of USB 1.1 hubs, as used by SET_FEATURE and CLEAR_FEATURE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
}

impl HubPortFeature {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::PortConnection,
            1 => Self::PortEnable,
            2 => Self::PortSuspend,
            3 => Self::PortOverCurrent,
            4 => Self::PortReset,
            8 => Self::PortPower,
            9 => Self::PortLowSpeed,
            16 => Self::CPortConnection,
            17 => Self::CPortEnable,
            18 => Self::CPortSuspend,
            19 => Self::CPortOverCurrent,
            20 => Self::CPortReset,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// wPortStatus in the low half, wPortChange in the high half.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        // bits 10-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        // bits 21 - 31 reserved
    }
}

unsafe impl plain::Plain for HubPortStatus {}

impl HubPortStatus {
    pub fn is_powered(&self) -> bool {
        self.contains(Self::POWER)
    }

    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_resetting(&self) -> bool {
        self.contains(Self::RESET)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.bits().to_le_bytes()
    }
}
