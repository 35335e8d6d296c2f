//! PDI bus session: programming mode, raw memory access and erase.

use std::time::Duration;

use anyhow::Context as _;
use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::{
    DEFAULT_PAGE_SIZE, MAX_PACKET_SIZE, MAX_RAMBUF_SIZE, NVM_BASE, erase_types, mem_types,
    page_mode, request,
};
use crate::device::PartDescriptor;
use crate::error::BusError;
use crate::protocol::{Command, Param, Status};
use crate::transport::Transport;

type Result<T> = std::result::Result<T, BusError>;

/// Operations a programmer needs from the bus to the target.
///
/// Calls are blocking round trips. The selected part is passed to every
/// memory access, the bus keeps no notion of the current chip.
pub trait PdiBus {
    fn set_timeout(&mut self, timeout_ms: u16) -> Result<()>;
    fn enable_programming_mode(&mut self, enable: bool) -> Result<()>;
    /// Configure the bus for a part, called whenever the selection changes
    fn select_part(&mut self, part: &PartDescriptor) -> Result<()>;
    fn read_memory(
        &mut self,
        part: &PartDescriptor,
        address: u32,
        len: usize,
        region: &str,
    ) -> Result<Vec<u8>>;
    fn write_memory(
        &mut self,
        part: &PartDescriptor,
        address: u32,
        data: &[u8],
        region: &str,
    ) -> Result<()>;
    /// Full device erase, may outlast the bus timeout
    fn erase_chip(&mut self) -> Result<()>;
    fn erase_app(&mut self) -> Result<()>;
}

impl<B: PdiBus + ?Sized> PdiBus for &mut B {
    fn set_timeout(&mut self, timeout_ms: u16) -> Result<()> {
        (**self).set_timeout(timeout_ms)
    }

    fn enable_programming_mode(&mut self, enable: bool) -> Result<()> {
        (**self).enable_programming_mode(enable)
    }

    fn select_part(&mut self, part: &PartDescriptor) -> Result<()> {
        (**self).select_part(part)
    }

    fn read_memory(
        &mut self,
        part: &PartDescriptor,
        address: u32,
        len: usize,
        region: &str,
    ) -> Result<Vec<u8>> {
        (**self).read_memory(part, address, len, region)
    }

    fn write_memory(
        &mut self,
        part: &PartDescriptor,
        address: u32,
        data: &[u8],
        region: &str,
    ) -> Result<()> {
        (**self).write_memory(part, address, data, region)
    }

    fn erase_chip(&mut self) -> Result<()> {
        (**self).erase_chip()
    }

    fn erase_app(&mut self) -> Result<()> {
        (**self).erase_app()
    }
}

/// XPROG memory type for a region name
fn mem_type(region: &str) -> Result<u8> {
    match region {
        "flash" | "app" => Ok(mem_types::APPL),
        "boot" => Ok(mem_types::BOOT),
        "eeprom" => Ok(mem_types::EEPROM),
        "fuse" => Ok(mem_types::FUSE),
        "lockbits" => Ok(mem_types::LOCKBITS),
        "usersig" => Ok(mem_types::USERSIG),
        "signature" | "prodsig" => Ok(mem_types::FACTORY_CALIBRATION),
        _ => Err(anyhow::format_err!("No XPROG memory type for region {:?}", region).into()),
    }
}

/// Map transport failures, USB timeouts are kept distinguishable
fn classify(err: anyhow::Error, what: &str) -> BusError {
    match err.downcast_ref::<rusb::Error>() {
        Some(rusb::Error::Timeout) => BusError::Timeout(what.to_string()),
        _ => BusError::Transfer(err.context(format!("{} failed", what))),
    }
}

/// PDI bus driven through the ChipWhisperer-Lite XPROG interface
pub struct XprogBus<T: Transport> {
    transport: T,
    show_progress: bool,
}

impl<T: Transport> XprogBus<T> {
    pub fn new(transport: T) -> Self {
        XprogBus {
            transport,
            show_progress: false,
        }
    }

    /// Draw progress bars on long reads and writes
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn transfer(&mut self, cmd: Command) -> Result<()> {
        let what = format!("{:?}", cmd);
        let opcode = cmd.opcode();
        let req = cmd.into_raw()?;
        log::debug!("=> {}", hex::encode(&req));
        self.transport
            .send_raw(u16::from(req[0]), &req[1..])
            .map_err(|e| classify(e, &what))?;

        let raw = self
            .transport
            .recv_raw(request::GET_STATUS, 2)
            .map_err(|e| classify(e, &what))?;
        log::debug!("<= {}", hex::encode(&raw));
        let status = Status::from_raw(&raw)?;
        if status.command != opcode {
            return Err(anyhow::format_err!(
                "Expected ACK on {:02x}, got {:02x}",
                opcode,
                status.command
            )
            .into());
        }
        if status.is_timeout() {
            return Err(BusError::Timeout(what));
        }
        if !status.is_ok() {
            return Err(anyhow::format_err!("{} failed, status = {:?}", what, status).into());
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize, msg: &'static str) -> ProgressBar {
        if !self.show_progress || len <= MAX_PACKET_SIZE {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64).with_message(msg);
        if let Ok(style) =
            ProgressStyle::with_template("{msg:>9} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }

    /// Copy one page into the programmer's RAM buffer
    fn stage_page(&mut self, page: &[u8]) -> Result<()> {
        for (i, chunk) in page.chunks(MAX_PACKET_SIZE).enumerate() {
            let offset = (i * MAX_PACKET_SIZE) as u16;
            let mut buf = Vec::with_capacity(2 + chunk.len());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(chunk);
            self.transport
                .send_raw(request::SET_RAMBUF, &buf)
                .map_err(|e| classify(e, "SetRamBuf"))?;
        }
        Ok(())
    }
}

impl<T: Transport> PdiBus for XprogBus<T> {
    fn set_timeout(&mut self, timeout_ms: u16) -> Result<()> {
        log::debug!("PDI timeout: {:?}", Duration::from_millis(timeout_ms.into()));
        self.transfer(Command::set_param(Param::Timeout(timeout_ms)))
    }

    fn enable_programming_mode(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.transfer(Command::EnterProgmode)
        } else {
            self.transfer(Command::LeaveProgmode)
        }
    }

    fn select_part(&mut self, part: &PartDescriptor) -> Result<()> {
        let eeprom_page = part
            .region("eeprom")
            .and_then(|r| r.page_size)
            .unwrap_or(32);
        log::debug!("Select part {}, EEPROM page {} bytes", part, eeprom_page);
        self.transfer(Command::set_param(Param::NvmBase(NVM_BASE)))?;
        self.transfer(Command::set_param(Param::EepromPageSize(
            u16::try_from(eeprom_page).context("EEPROM page size out of range")?,
        )))
    }

    fn read_memory(
        &mut self,
        _part: &PartDescriptor,
        address: u32,
        len: usize,
        region: &str,
    ) -> Result<Vec<u8>> {
        let mem_type = mem_type(region)?;
        let bar = self.progress_bar(len, "Reading");
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let n = MAX_PACKET_SIZE.min(len - data.len());
            let addr = address + data.len() as u32;
            self.transfer(Command::read_mem(mem_type, addr, n as u16))?;
            let chunk = self
                .transport
                .recv_raw(request::GET_RAMBUF, n)
                .map_err(|e| classify(e, "GetRamBuf"))?;
            if chunk.len() != n {
                bar.abandon();
                return Err(anyhow::format_err!(
                    "Short read at 0x{:08x}: {} of {} bytes",
                    addr,
                    chunk.len(),
                    n
                )
                .into());
            }
            data.extend_from_slice(&chunk);
            bar.inc(n as u64);
        }
        bar.finish_and_clear();
        Ok(data)
    }

    fn write_memory(
        &mut self,
        part: &PartDescriptor,
        address: u32,
        data: &[u8],
        region: &str,
    ) -> Result<()> {
        let mem_type = mem_type(region)?;
        let page_size = part
            .region(region)
            .and_then(|r| r.page_size)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 || page_size > MAX_RAMBUF_SIZE {
            return Err(anyhow::format_err!(
                "Page size {} of {} not supported (max {})",
                page_size,
                region,
                MAX_RAMBUF_SIZE
            )
            .into());
        }
        // EEPROM pages are not cleared by a chip erase of flash
        let mode = if mem_type == mem_types::EEPROM {
            page_mode::ERASE | page_mode::WRITE
        } else {
            page_mode::WRITE
        };

        let bar = self.progress_bar(data.len(), "Writing");
        for (i, page) in data.chunks(page_size).enumerate() {
            let addr = address + (i * page_size) as u32;
            self.stage_page(page)?;
            self.transfer(Command::write_mem(mem_type, mode, addr, page.len() as u16))?;
            bar.inc(page.len() as u64);
        }
        bar.finish_and_clear();
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.transfer(Command::erase(erase_types::CHIP))
    }

    fn erase_app(&mut self) -> Result<()> {
        self.transfer(Command::erase(erase_types::APP))
    }
}
