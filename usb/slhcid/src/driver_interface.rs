pub extern crate serde;

use std::{fmt, result, str};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sl811::{Bus, ChipPort};
pub use crate::usb::{EndpointTy, Setup, ENDP_ATTR_TY_MASK};

/// Handle of an open pipe. Ids are never reused while the controller exists.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PipeId(pub u32);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pipe {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Full,
    Low,
}

/// Where a device sits relative to the root port.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum HubRelation {
    /// Plugged straight into the root port.
    RootPort,
    /// Behind an external hub. Low-speed devices there need preamble packets.
    ExternalHub,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EndpDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpDirection {
    Out,
    In,
    Bidirectional,
}

impl EndpDesc {
    /// The default control pipe of a device, before its descriptors are known.
    pub const fn control(max_packet_size: u16) -> Self {
        Self {
            address: 0,
            attributes: EndpointTy::Ctrl as u8,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn bulk_in(number: u8, max_packet_size: u16) -> Self {
        Self {
            address: 0x80 | number,
            attributes: EndpointTy::Bulk as u8,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        Self {
            address: number,
            attributes: EndpointTy::Bulk as u8,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn interrupt_in(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: 0x80 | number,
            attributes: EndpointTy::Interrupt as u8,
            max_packet_size,
            interval,
        }
    }

    pub fn ty(self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
    pub fn is_control(&self) -> bool {
        self.ty() == EndpointTy::Ctrl
    }
    pub fn is_interrupt(&self) -> bool {
        self.ty() == EndpointTy::Interrupt
    }
    pub fn is_bulk(&self) -> bool {
        self.ty() == EndpointTy::Bulk
    }
    pub fn is_isoch(&self) -> bool {
        self.ty() == EndpointTy::Isoch
    }
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
    pub fn direction(&self) -> EndpDirection {
        if self.is_control() {
            return EndpDirection::Bidirectional;
        }
        if self.address & 0x80 != 0 {
            EndpDirection::In
        } else {
            EndpDirection::Out
        }
    }
}

impl From<crate::usb::EndpointDescriptor> for EndpDesc {
    fn from(desc: crate::usb::EndpointDescriptor) -> Self {
        Self {
            address: desc.address,
            attributes: desc.attributes,
            max_packet_size: desc.max_packet_size(),
            interval: desc.interval,
        }
    }
}

/// Everything needed to open a pipe to one endpoint of a device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PipeParams {
    pub device_address: u8,
    pub endpoint: EndpDesc,
    pub speed: DeviceSpeed,
    pub hub: HubRelation,
}

impl PipeParams {
    pub const fn new(device_address: u8, endpoint: EndpDesc, speed: DeviceSpeed) -> Self {
        Self {
            device_address,
            endpoint,
            speed,
            hub: HubRelation::RootPort,
        }
    }

    pub const fn behind_hub(mut self) -> Self {
        self.hub = HubRelation::ExternalHub;
        self
    }
}

/// Outcome of a transfer, delivered once through its callback.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Still owned by the scheduler.
    Pending,
    Ok,
    /// Completed without error, but fewer bytes than requested moved.
    Short,
    Stalled,
    /// The transfer's deadline passed.
    Timeout,
    /// The retry limit for transaction errors was exceeded.
    IoError,
    /// Aborted, or the device went away.
    Cancelled,
    /// The request could not be carried out as specified.
    Invalid,
}

impl TransferStatus {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Pending | Self::Ok | Self::Short)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Short => "short",
            Self::Stalled => "stalled",
            Self::Timeout => "timeout",
            Self::IoError => "io_error",
            Self::Cancelled => "cancelled",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl str::FromStr for TransferStatus {
    type Err = Invalid;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "ok" => Self::Ok,
            "short" => Self::Short,
            "stalled" => Self::Stalled,
            "timeout" => Self::Timeout,
            "io_error" => Self::IoError,
            "cancelled" => Self::Cancelled,
            "invalid" => Self::Invalid,
            _ => return Err(Invalid("unknown transfer status")),
        })
    }
}

#[derive(Debug, Error)]
#[error("invalid input")]
pub struct Invalid(pub &'static str);

/// What a completion callback gets to see of its finished transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub pipe: PipeId,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// The transfer buffer; for IN transfers the first `actual_length` bytes are valid.
    pub buffer: Vec<u8>,
}

impl Completion {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Completion callback. It runs in the deferred context with the pipe lock held, and may use
/// the [`Bus`] to submit more work or close pipes.
pub type Callback<P> = Box<dyn FnMut(&mut Bus<'_, P>, &Completion) + Send>;

/// A unit of work submitted to a pipe.
pub struct TransferRequest<P: ChipPort> {
    pub buffer: Vec<u8>,
    /// Bytes to move; at most `buffer.len()`.
    pub length: usize,
    /// Required on control pipes.
    pub setup: Option<Setup>,
    /// Deadline in frames (milliseconds) from submission.
    pub timeout: Option<u32>,
    /// End an OUT transfer that is a multiple of the max packet size with a zero length packet.
    pub force_short: bool,
    /// Resubmit automatically after each completion.
    pub repeat: bool,
    pub callback: Callback<P>,
}

impl<P: ChipPort> TransferRequest<P> {
    pub fn new<F>(buffer: Vec<u8>, callback: F) -> Self
    where
        F: FnMut(&mut Bus<'_, P>, &Completion) + Send + 'static,
    {
        Self {
            length: buffer.len(),
            buffer,
            setup: None,
            timeout: None,
            force_short: false,
            repeat: false,
            callback: Box::new(callback),
        }
    }

    /// A control transfer; the data stage buffer is sized from the setup packet.
    pub fn control<F>(setup: Setup, callback: F) -> Self
    where
        F: FnMut(&mut Bus<'_, P>, &Completion) + Send + 'static,
    {
        let mut req = Self::new(vec![0; usize::from(setup.length())], callback);
        req.setup = Some(setup);
        req
    }

    pub fn with_timeout(mut self, frames: u32) -> Self {
        self.timeout = Some(frames);
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn force_short(mut self) -> Self {
        self.force_short = true;
        self
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

impl<P: ChipPort> fmt::Debug for TransferRequest<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("length", &self.length)
            .field("setup", &self.setup)
            .field("timeout", &self.timeout)
            .field("force_short", &self.force_short)
            .field("repeat", &self.repeat)
            .finish()
    }
}

/// Errors returned synchronously by the host controller API.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("periodic bandwidth exceeded: {requested} requested with {committed} of {limit} committed")]
    BandwidthExceeded {
        requested: u32,
        committed: u32,
        limit: u32,
    },
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error("controller is disabled")]
    Disabled,
    #[error("pipe already has a transfer")]
    Busy,
    #[error("no such pipe")]
    NoSuchPipe,
    #[error("controller is not active")]
    NotActive,
    #[error("unsupported chip revision {0:#x}")]
    UnsupportedChip(u8),
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Internal inconsistencies between the driver and the chip. Each one halts the controller.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum ConsistencyViolation {
    #[error("completion for a slot that was not armed")]
    CompletionNotArmed,
    #[error("transaction finished without status")]
    NoStatus,
    #[error("remaining count larger than the programmed length")]
    CountExceedsLength,
    #[error("setup bit in a host transaction status")]
    SetupStatusBit,
    #[error("transaction in progress for two frames without completion")]
    MissedCompletion,
    #[error("data toggle cleared with a transfer in flight")]
    ToggleClearedInFlight,
    #[error("interrupt enable register does not match the programmed mask")]
    InterruptMaskCorrupted,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TransferStatus::Ok,
            TransferStatus::Short,
            TransferStatus::IoError,
            TransferStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn endpoint_directions() {
        assert_eq!(EndpDesc::control(8).direction(), EndpDirection::Bidirectional);
        assert_eq!(EndpDesc::bulk_in(1, 64).direction(), EndpDirection::In);
        assert_eq!(EndpDesc::bulk_out(2, 64).direction(), EndpDirection::Out);
        assert!(EndpDesc::interrupt_in(1, 8, 10).is_interrupt());
        assert_eq!(EndpDesc::interrupt_in(3, 8, 10).number(), 3);
    }
}
