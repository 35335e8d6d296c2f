//! Abstract programmer transport interface.
use anyhow::Result;

pub use self::usb::UsbTransport;

mod usb;

/// Abstraction of the link to the programmer hardware.
///
/// Every XPROG exchange is a vendor request, `value` selects the command or
/// buffer operation.
pub trait Transport {
    fn send_raw(&mut self, value: u16, raw: &[u8]) -> Result<()>;
    fn recv_raw(&mut self, value: u16, len: usize) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_raw(&mut self, value: u16, raw: &[u8]) -> Result<()> {
        (**self).send_raw(value, raw)
    }

    fn recv_raw(&mut self, value: u16, len: usize) -> Result<Vec<u8>> {
        (**self).recv_raw(value, len)
    }
}
