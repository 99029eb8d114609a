use super::DescriptorKind;

/// The eight byte SETUP packet opening every control transfer.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
pub enum ReqType {
    /// Standard device requests, such as SET_ADDRESS and SET_CONFIGURATION.
    Standard = 0,

    /// Class specific requests, the hub class ones are served by the root hub emulator.
    Class = 1,

    /// Vendor specific requests.
    Vendor = 2,

    /// Reserved
    Reserved = 3,
}

#[repr(u8)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    /// Hub class requests address ports through this recipient.
    Other = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

impl SetupReq {
    pub fn from_u8(request: u8) -> Option<Self> {
        Some(match request {
            0x00 => Self::GetStatus,
            0x01 => Self::ClearFeature,
            0x03 => Self::SetFeature,
            0x05 => Self::SetAddress,
            0x06 => Self::GetDescriptor,
            0x07 => Self::SetDescriptor,
            0x08 => Self::GetConfiguration,
            0x09 => Self::SetConfiguration,
            0x0A => Self::GetInterface,
            0x0B => Self::SetInterface,
            0x0C => Self::SynchFrame,
            _ => return None,
        })
    }
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_DIR_SHIFT: u8 = 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

// Complete bmRequestType values.
pub const WRITE_DEVICE: u8 = 0x00;
pub const WRITE_INTERFACE: u8 = 0x01;
pub const WRITE_ENDPOINT: u8 = 0x02;
pub const WRITE_CLASS_DEVICE: u8 = 0x20;
pub const WRITE_CLASS_OTHER: u8 = 0x23;
pub const READ_DEVICE: u8 = 0x80;
pub const READ_INTERFACE: u8 = 0x81;
pub const READ_ENDPOINT: u8 = 0x82;
pub const READ_CLASS_DEVICE: u8 = 0xA0;
pub const READ_CLASS_OTHER: u8 = 0xA3;

impl Setup {
    pub const SIZE: usize = 8;

    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    pub const fn is_read(&self) -> bool {
        self.kind & USB_SETUP_DIR_BIT != 0
    }

    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }

    pub fn value(&self) -> u16 {
        u16::from_le(self.value)
    }

    pub fn index(&self) -> u16 {
        u16::from_le(self.index)
    }

    pub fn length(&self) -> u16 {
        u16::from_le(self.length)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0] = self.kind;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value().to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index().to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            kind: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]).to_le(),
            index: u16::from_le_bytes([bytes[4], bytes[5]]).to_le(),
            length: u16::from_le_bytes([bytes[6], bytes[7]]).to_le(),
        }
    }

    pub const fn new(kind: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            kind,
            request,
            value: value.to_le(),
            index: index.to_le(),
            length: length.to_le(),
        }
    }

    pub const fn get_status() -> Self {
        Self::new(READ_DEVICE, SetupReq::GetStatus as u8, 0, 0, 2)
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self::new(WRITE_DEVICE, SetupReq::ClearFeature as u8, feature, 0, 0)
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self::new(WRITE_DEVICE, SetupReq::SetFeature as u8, feature, 0, 0)
    }

    pub const fn set_address(address: u16) -> Self {
        Self::new(WRITE_DEVICE, SetupReq::SetAddress as u8, address, 0, 0)
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self::new(
            READ_DEVICE,
            SetupReq::GetDescriptor as u8,
            ((kind as u16) << 8) | (index as u16),
            language,
            length,
        )
    }

    pub const fn get_configuration() -> Self {
        Self::new(READ_DEVICE, SetupReq::GetConfiguration as u8, 0, 0, 1)
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self::new(WRITE_DEVICE, SetupReq::SetConfiguration as u8, value as u16, 0, 0)
    }

    pub const fn get_interface(interface: u8) -> Self {
        Self::new(READ_INTERFACE, SetupReq::GetInterface as u8, 0, interface as u16, 1)
    }

    pub const fn get_hub_descriptor(length: u16) -> Self {
        Self::new(
            READ_CLASS_DEVICE,
            SetupReq::GetDescriptor as u8,
            (DescriptorKind::Hub as u16) << 8,
            0,
            length,
        )
    }

    pub const fn get_hub_status() -> Self {
        Self::new(READ_CLASS_DEVICE, SetupReq::GetStatus as u8, 0, 0, 4)
    }

    pub const fn get_port_status(port: u16) -> Self {
        Self::new(READ_CLASS_OTHER, SetupReq::GetStatus as u8, 0, port, 4)
    }

    pub const fn set_port_feature(port: u16, feature: super::HubPortFeature) -> Self {
        Self::new(
            WRITE_CLASS_OTHER,
            SetupReq::SetFeature as u8,
            feature as u16,
            port,
            0,
        )
    }

    pub const fn clear_port_feature(port: u16, feature: super::HubPortFeature) -> Self {
        Self::new(
            WRITE_CLASS_OTHER,
            SetupReq::ClearFeature as u8,
            feature as u16,
            port,
            0,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_layout() {
        let setup = Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 0x0109);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x01]);
        assert!(setup.is_read());

        let parsed = Setup::from_bytes(setup.to_bytes());
        assert_eq!(parsed.value(), 0x0200);
        assert_eq!(parsed.length(), 0x0109);
    }

    #[test]
    fn port_requests_target_other() {
        let setup = Setup::set_port_feature(1, super::super::HubPortFeature::PortReset);
        assert_eq!(setup.req_ty(), ReqType::Class as u8);
        assert_eq!(setup.req_recipient(), ReqRecipient::Other as u8);
        assert_eq!(setup.value(), 4);
        assert_eq!(setup.index(), 1);
        assert!(!setup.is_read());
    }
}
