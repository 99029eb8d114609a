//! USB 1.1 protocol structures.
//!
//! Standard and hub-class descriptors, setup packets and hub port status bits. The scheduler
//! only needs these to emulate the root hub and to decode control requests; they follow the
//! layouts in chapters 9 and 11 of the USB 1.1 specification.
pub use self::config::ConfigDescriptor;
pub use self::device::DeviceDescriptor;
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::hub::*;
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};

/// Descriptor types a USB 1.1 device or hub can report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    /// A Configuration Descriptor. See [ConfigDescriptor]
    Configuration = 2,
    /// A String Descriptor, UTF-16LE text prefixed by length and kind.
    String = 3,
    /// An Interface Descriptor. See [InterfaceDescriptor]
    Interface = 4,
    /// An Endpoint Descriptor. See [EndpointDescriptor]
    Endpoint = 5,
    /// A USB Hub Descriptor. See [HubDescriptor]
    Hub = 41,
}

impl DescriptorKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            1 => Self::Device,
            2 => Self::Configuration,
            3 => Self::String,
            4 => Self::Interface,
            5 => Self::Endpoint,
            41 => Self::Hub,
            _ => return None,
        })
    }
}

/// Device class code of hubs.
pub const HUB_CLASS: u8 = 0x09;

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod interface;
pub(crate) mod setup;
