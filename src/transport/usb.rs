//! USB Transportation.
use std::time::Duration;

use anyhow::Result;
use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::Transport;
use crate::constants::{REQ_XMEGA_PROGRAM, USB_PRODUCT_ID, USB_VENDOR_ID};

const REQUEST_TYPE_OUT: u8 = 0x41;
const REQUEST_TYPE_IN: u8 = 0xc1;

/// Host side limit for a single control transfer, the target's PDI timeout is set separately
const TIMEOUT_MS: u64 = 5000;

pub struct UsbTransport {
    device_handle: DeviceHandle<rusb::Context>,
}

fn is_chipwhisperer(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == USB_VENDOR_ID && desc.product_id() == USB_PRODUCT_ID)
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(is_chipwhisperer)
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found ChipWhisperer-Lite USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(nth: usize) -> Result<UsbTransport> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .filter(is_chipwhisperer)
            .nth(nth)
            .ok_or(anyhow::format_err!(
                "No ChipWhisperer-Lite found({:04x}:{:04x} device not found at index #{})",
                USB_VENDOR_ID,
                USB_PRODUCT_ID,
                nth
            ))?;
        log::debug!("Found USB Device {:?}", device);

        let device_handle = device.open()?;
        device_handle.set_active_configuration(1)?;
        device_handle.claim_interface(0)?;

        Ok(UsbTransport { device_handle })
    }

    pub fn open_any() -> Result<UsbTransport> {
        Self::open_nth(0)
    }
}

impl Transport for UsbTransport {
    fn send_raw(&mut self, value: u16, raw: &[u8]) -> Result<()> {
        self.device_handle.write_control(
            REQUEST_TYPE_OUT,
            REQ_XMEGA_PROGRAM,
            value,
            0,
            raw,
            Duration::from_millis(TIMEOUT_MS),
        )?;
        Ok(())
    }

    fn recv_raw(&mut self, value: u16, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let nread = self.device_handle.read_control(
            REQUEST_TYPE_IN,
            REQ_XMEGA_PROGRAM,
            value,
            0,
            &mut buf,
            Duration::from_millis(TIMEOUT_MS),
        )?;
        buf.truncate(nread);
        Ok(buf)
    }
}
