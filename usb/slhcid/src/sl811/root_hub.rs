//! Emulation of the single-port root hub.
//!
//! The chip has one downstream port and no hub logic of its own, so requests on the root
//! address are answered here from the controller flags, synchronously at submission.

use log::{debug, info, warn};
use smallvec::SmallVec;

use super::regs::{self, ChipPort, Ctrl1, Interrupts};
use super::scheduler::{ControllerFlags, Scheduler, ROOT_INTR_ENDPOINT};
use crate::driver_interface::{PipeId, TransferStatus};
use crate::usb::setup::{
    READ_CLASS_DEVICE, READ_CLASS_OTHER, READ_DEVICE, READ_ENDPOINT, READ_INTERFACE,
    WRITE_CLASS_OTHER, WRITE_DEVICE,
};
use crate::usb::{
    ConfigDescriptor, DescriptorKind, DeviceDescriptor, EndpointDescriptor, EndpointTy,
    HubCharacteristics, HubDescriptor, HubPortFeature, InterfaceDescriptor, Setup, SetupReq,
    HUB_CLASS,
};

const SCANLOGIC_VENDOR: u16 = 0x04CE;
const MANUFACTURER: &str = "ScanLogic/Cypress";
const PRODUCT: &str = "SL811HS/T root hub";
/// US English, the only language the string descriptors come in.
const LANGUAGE_TABLE: [u8; 4] = [4, DescriptorKind::String as u8, 0x09, 0x04];

/// Time from port power on until power is good, in 2 ms units.
const POWER_ON_GOOD: u8 = 50;
/// Budget of a bus powered port, in mA.
const PORT_CURRENT_BUDGET: u32 = 500;

const STATUS_SELF_POWERED: u16 = 0x0001;

/// Wire representation of a packed descriptor.
fn bytes_of<T: plain::Plain>(desc: &T) -> &[u8] {
    // Plain types are plain old data without padding.
    unsafe { plain::as_bytes(desc) }
}

type Response = SmallVec<[u8; 64]>;

fn string_descriptor(text: &str, out: &mut Response) {
    out.push(0);
    out.push(DescriptorKind::String as u8);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
}

impl<P: ChipPort> Scheduler<P> {
    /// Answers a control request on the root hub's default pipe.
    pub(super) fn root_control(&mut self, id: PipeId) {
        let (setup, length) = match self
            .pipes
            .get(&id)
            .and_then(|pipe| pipe.transfer.as_ref())
        {
            Some(transfer) => match transfer.setup {
                Some(setup) => (setup, transfer.length),
                None => return,
            },
            None => return,
        };

        let mut response = Response::new();
        let result = self.root_request(&setup, length, &mut response);

        if let Some(transfer) = self
            .pipes
            .get_mut(&id)
            .and_then(|pipe| pipe.transfer.as_mut())
        {
            match result {
                Ok(()) => transfer.respond(&response),
                Err(status) => transfer.status = status,
            }
        }
        self.finish(id);
    }

    fn root_request(
        &mut self,
        setup: &Setup,
        length: usize,
        out: &mut Response,
    ) -> Result<(), TransferStatus> {
        let value = setup.value();
        let index = setup.index();
        let kind = setup.kind;
        let request = setup.request;
        debug!(
            "root hub request {:#04x}/{:#04x} value {:#06x} index {} length {}",
            kind, request, value, index, length
        );

        match (SetupReq::from_u8(request), kind) {
            (Some(SetupReq::ClearFeature), WRITE_CLASS_OTHER) if index == 1 => {
                self.clear_port_feature(value)
            }
            (Some(SetupReq::SetFeature), WRITE_CLASS_OTHER) if index == 1 => {
                self.set_port_feature(value)
            }
            (Some(SetupReq::SetAddress), WRITE_DEVICE) if value < 128 => {
                self.root_address = value as u8;
                Ok(())
            }
            (Some(SetupReq::SetConfiguration), WRITE_DEVICE) if value <= 1 => {
                self.root_config = value as u8;
                Ok(())
            }
            (Some(SetupReq::GetStatus), READ_CLASS_OTHER) if index == 1 && length >= 4 => {
                out.extend_from_slice(&self.port_status().to_bytes());
                Ok(())
            }
            (Some(SetupReq::GetStatus), READ_CLASS_DEVICE) if length >= 4 => {
                // Neither local power nor over-current is ever reported.
                out.extend_from_slice(&[0; 4]);
                Ok(())
            }
            (Some(SetupReq::GetStatus), READ_DEVICE) if length >= 2 => {
                out.extend_from_slice(&STATUS_SELF_POWERED.to_le_bytes());
                Ok(())
            }
            (Some(SetupReq::GetStatus), READ_INTERFACE | READ_ENDPOINT) if length >= 2 => {
                out.extend_from_slice(&[0; 2]);
                Ok(())
            }
            (Some(SetupReq::GetConfiguration), READ_DEVICE) if length >= 1 => {
                out.push(self.root_config);
                Ok(())
            }
            (Some(SetupReq::GetInterface), READ_INTERFACE) if length >= 1 => {
                out.push(0);
                Ok(())
            }
            (Some(SetupReq::GetDescriptor), READ_DEVICE) => self.standard_descriptor(value, out),
            (Some(SetupReq::GetDescriptor), READ_CLASS_DEVICE)
                if value >> 8 == u16::from(HubDescriptor::DESCRIPTOR_KIND) =>
            {
                out.extend_from_slice(bytes_of(&self.hub_descriptor()));
                Ok(())
            }
            _ => {
                debug!("unsupported root hub request {:#04x}/{:#04x}", kind, request);
                Err(TransferStatus::IoError)
            }
        }
    }

    fn standard_descriptor(&self, value: u16, out: &mut Response) -> Result<(), TransferStatus> {
        let index = value & 0xFF;
        match DescriptorKind::from_u8((value >> 8) as u8) {
            Some(DescriptorKind::Device) => {
                out.extend_from_slice(bytes_of(&device_descriptor()));
            }
            Some(DescriptorKind::Configuration) => {
                let total = ConfigDescriptor::SIZE + InterfaceDescriptor::SIZE + EndpointDescriptor::SIZE;
                let config = ConfigDescriptor {
                    length: ConfigDescriptor::SIZE,
                    kind: DescriptorKind::Configuration as u8,
                    total_length: u16::from(total).to_le(),
                    interfaces: 1,
                    configuration_value: 1,
                    configuration_str: 0,
                    attributes: ConfigDescriptor::ATTR_ONE | ConfigDescriptor::ATTR_SELF_POWERED,
                    max_power: self.config.max_current,
                };
                let interface = InterfaceDescriptor {
                    length: InterfaceDescriptor::SIZE,
                    kind: DescriptorKind::Interface as u8,
                    number: 0,
                    alternate_setting: 0,
                    endpoints: 1,
                    class: HUB_CLASS,
                    sub_class: 0,
                    protocol: 0,
                    interface_str: 0,
                };
                let endpoint =
                    EndpointDescriptor::new(ROOT_INTR_ENDPOINT, EndpointTy::Interrupt, 8, 255);
                out.extend_from_slice(bytes_of(&config));
                out.extend_from_slice(bytes_of(&interface));
                out.extend_from_slice(bytes_of(&endpoint));
            }
            Some(DescriptorKind::String) => match index {
                0 => out.extend_from_slice(&LANGUAGE_TABLE),
                1 => string_descriptor(MANUFACTURER, out),
                2 => string_descriptor(PRODUCT, out),
                _ => return Err(TransferStatus::IoError),
            },
            _ => {
                debug!("no root hub descriptor {:#06x}", value);
                return Err(TransferStatus::IoError);
            }
        }
        Ok(())
    }

    fn hub_descriptor(&self) -> HubDescriptor {
        let port_current = u32::from(self.config.max_current) * 2;
        let current = PORT_CURRENT_BUDGET.saturating_sub(port_current).min(255) as u8;
        HubDescriptor {
            length: HubDescriptor::SIZE,
            kind: HubDescriptor::DESCRIPTOR_KIND,
            ports: 1,
            characteristics: (HubCharacteristics::POWER_INDIVIDUAL
                | HubCharacteristics::OVER_CURRENT_NONE)
                .bits()
                .to_le(),
            power_on_good: POWER_ON_GOOD,
            current,
            device_removable: 0,
            port_power_control_mask: 0,
        }
    }

    fn set_port_feature(&mut self, value: u16) -> Result<(), TransferStatus> {
        match HubPortFeature::from_u16(value) {
            Some(HubPortFeature::PortReset) => {
                if !self
                    .flags
                    .contains(ControllerFlags::ACTIVE | ControllerFlags::POWER)
                {
                    debug!("port reset while inactive or unpowered");
                    return Err(TransferStatus::Invalid);
                }
                if self.flags.contains(ControllerFlags::RESET) {
                    return Ok(());
                }
                self.set_interrupts(Interrupts::empty());
                self.drain();
                self.write(regs::CTRL1, Ctrl1::RESET_ENGINE.bits());
                self.flags.insert(ControllerFlags::RESET);
                self.reset_requested = true;
                Ok(())
            }
            Some(HubPortFeature::PortSuspend) => {
                warn!("USB suspend is not implemented");
                Ok(())
            }
            Some(HubPortFeature::PortPower) => {
                if !self.flags.contains(ControllerFlags::ACTIVE) {
                    return Err(TransferStatus::Invalid);
                }
                if self.flags.contains(ControllerFlags::POWER) {
                    return Ok(());
                }
                self.flags
                    .insert(ControllerFlags::REAL_POWER | ControllerFlags::POWER);

                let isr = Interrupts::from_bits_truncate(self.read(regs::ISR));
                if isr.contains(Interrupts::INSERT) {
                    self.write(regs::ISR, Interrupts::INSERT.bits());
                }
                if isr.contains(Interrupts::NODEV) {
                    self.set_interrupts(Interrupts::INSERT);
                    self.flags.insert(ControllerFlags::NO_DEVICE);
                } else {
                    self.flags.remove(ControllerFlags::NO_DEVICE);
                    self.flags
                        .insert(ControllerFlags::C_CONNECT | ControllerFlags::ROOT_INTR);
                }
                info!("port power on");
                Ok(())
            }
            _ => {
                debug!("unsupported port feature {}", value);
                Err(TransferStatus::IoError)
            }
        }
    }

    fn clear_port_feature(&mut self, value: u16) -> Result<(), TransferStatus> {
        match HubPortFeature::from_u16(value) {
            Some(HubPortFeature::PortPower) => {
                self.flags.remove(ControllerFlags::POWER);
                if !self.flags.contains(ControllerFlags::NO_DEVICE) {
                    self.flags.insert(
                        ControllerFlags::NO_DEVICE
                            | ControllerFlags::C_CONNECT
                            | ControllerFlags::ROOT_INTR,
                    );
                }
                self.set_interrupts(Interrupts::empty());
                self.drain();
                info!("port power off");
                Ok(())
            }
            Some(HubPortFeature::CPortConnection) => {
                self.flags.remove(ControllerFlags::C_CONNECT);
                Ok(())
            }
            Some(HubPortFeature::CPortReset) => {
                self.flags.remove(ControllerFlags::C_RESET);
                Ok(())
            }
            Some(HubPortFeature::PortEnable) => {
                self.drain();
                Ok(())
            }
            Some(HubPortFeature::PortSuspend) => Ok(()),
            _ => {
                debug!("unsupported port feature {} to clear", value);
                Err(TransferStatus::IoError)
            }
        }
    }

    /// Arms the status change pipe. It completes on the next pending port change.
    pub(super) fn arm_root_interrupt(&mut self, id: PipeId) {
        self.root_intr = Some(id);
        let pending = self.flags.intersects(ControllerFlags::CHANGE);
        self.flags.set(ControllerFlags::ROOT_INTR, pending);
    }

    pub(super) fn complete_root_interrupt(&mut self) {
        let id = match self.root_intr.take() {
            Some(id) => id,
            None => return,
        };
        if let Some(transfer) = self
            .pipes
            .get_mut(&id)
            .and_then(|pipe| pipe.transfer.as_mut())
        {
            // Bit 1 is port 1; bit 0 would be the hub itself.
            transfer.respond(&[0x02]);
        }
        self.finish(id);
    }
}

fn device_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        length: DeviceDescriptor::SIZE,
        kind: DescriptorKind::Device as u8,
        usb: 0x0101u16.to_le(),
        class: HUB_CLASS,
        sub_class: 0,
        protocol: 0,
        packet_size: 64,
        vendor: SCANLOGIC_VENDOR.to_le(),
        product: 0,
        release: 0,
        manufacturer_str: 1,
        product_str: 2,
        serial_str: 0,
        configurations: 1,
    }
}
