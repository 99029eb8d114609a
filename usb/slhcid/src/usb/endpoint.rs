use plain::Plain;

/// The descriptor for a USB Endpoint.
///
/// Each endpoint of an interface has its own descriptor. The scheduler reads the transfer type,
/// the max packet size and the polling interval out of it when a pipe is opened.
///
/// It is returned as part of the configuration descriptor and cannot be requested
/// individually. See USB 1.1 section 9.6.4.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    /// Endpoint number in the low nibble, direction in bit 7 (set for IN).
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    /// Polling interval in frames, for interrupt endpoints.
    pub interval: u8,
}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_DIR_IN: u8 = 0x80;
pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub const SIZE: u8 = 7;

    pub fn new(address: u8, ty: EndpointTy, max_packet_size: u16, interval: u8) -> Self {
        Self {
            length: Self::SIZE,
            kind: super::DescriptorKind::Endpoint as u8,
            address,
            attributes: ty as u8,
            max_packet_size: max_packet_size.to_le(),
            interval,
        }
    }

    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }

    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUM_MASK
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDP_ADDR_DIR_IN != 0
    }

    pub fn max_packet_size(&self) -> u16 {
        u16::from_le(self.max_packet_size)
    }
}

unsafe impl Plain for EndpointDescriptor {}
