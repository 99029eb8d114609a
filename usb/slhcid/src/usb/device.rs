//! Implements the "Device" USB Descriptor.
//!
//! This descriptor is described in USB 1.1 section 9.6.1

/// A USB Device Descriptor.
///
/// It "provides information that applies globally to the device and all the device's
/// configurations". A given device will only have one device descriptor.
///
/// USB 1.1 Table 9-7 describes the packet offsets of the fields described by this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// The length of this descriptor in bytes.
    pub length: u8,
    /// The descriptor type. See [DescriptorKind](super::DescriptorKind)
    pub kind: u8,
    /// The USB standard version in binary-coded decimal.
    ///
    /// USB 1.1 is encoded as 110H.
    pub usb: u16,
    /// The USB Class Code.
    ///
    /// These are values assigned by USB-IF that describes the type of device connected via USB.
    /// Hubs report [HUB_CLASS](super::HUB_CLASS).
    pub class: u8,
    /// The USB Sub Device Class Code.
    pub sub_class: u8,
    /// The USB Protocol code.
    ///
    /// This is qualified by the class and sub_class fields.
    pub protocol: u8,
    /// The maximum packet size for endpoint 0.
    pub packet_size: u8,
    /// The USB Vendor ID
    pub vendor: u16,
    /// The USB Product ID
    pub product: u16,
    /// The device release number in binary-coded decimal.
    pub release: u16,
    /// Index of the String Descriptor describing the device manufacturer
    pub manufacturer_str: u8,
    /// Index of the String Descriptor describing the product
    pub product_str: u8,
    /// Index of the string descriptor describing the device's serial number
    pub serial_str: u8,
    /// The number of possible configurations (Configuration Descriptors) for this device.
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub const SIZE: u8 = 18;

    /// Gets the USB Minor Version
    pub fn minor_usb_vers(&self) -> u8 {
        (u16::from_le(self.usb) & 0xFF) as u8
    }
    /// Gets the USB Major Version
    pub fn major_usb_vers(&self) -> u8 {
        ((u16::from_le(self.usb) >> 8) & 0xFF) as u8
    }
}
