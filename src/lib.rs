//! AVR XMEGA programming over PDI, through a ChipWhisperer-Lite.

pub mod bus;
pub mod constants;
pub mod device;
pub mod error;
pub mod format;
pub mod programmer;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use self::bus::{PdiBus, XprogBus};
pub use self::device::{MemoryRegion, PartDb, PartDescriptor};
pub use self::error::{BusError, Error, Mismatch};
pub use self::format::{FileImageSource, FirmwareImage, ImageSource};
pub use self::programmer::{
    DiscoveryResult, EraseTarget, ProgramResult, Programmer, ProgrammerConfig, VerifyPolicy,
};
pub use self::sim::SimBus;
pub use self::transport::Transport;
