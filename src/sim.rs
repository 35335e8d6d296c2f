//! In-memory PDI bus, emulating an XMEGA without hardware.
//!
//! Used by the test-suite and by `--simulate`. Faults can be injected to
//! exercise error paths: read-back corruption, chip-erase timeouts and
//! transfer failures.

use std::collections::BTreeMap;

use crate::bus::PdiBus;
use crate::constants::SIGNATURE_ADDRESS;
use crate::device::PartDescriptor;
use crate::error::BusError;

type Result<T> = std::result::Result<T, BusError>;

/// Start of the PDI data space, everything below is NVM program space
const DATA_SPACE: u32 = 0x0100_0000;

/// Number of calls per bus operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub set_timeout: usize,
    pub enable: usize,
    pub disable: usize,
    pub select_part: usize,
    pub read: usize,
    pub write: usize,
    pub erase_chip: usize,
    pub erase_app: usize,
}

impl CallCounts {
    /// Calls that touch the target memory
    pub fn memory_ops(&self) -> usize {
        self.read + self.write + self.erase_chip + self.erase_app
    }
}

#[derive(Debug, Default)]
pub struct SimBus {
    /// Sparse memory, unset addresses read as erased (0xff)
    memory: BTreeMap<u32, u8>,
    selected: Option<PartDescriptor>,
    programming: bool,
    /// Set after a timeout, cleared by leaving programming mode
    stalled: bool,
    timeout_ms: Option<u16>,
    calls: CallCounts,
    corrupt: BTreeMap<u32, u8>,
    chip_erase_timeout: bool,
    /// Reads left before reads start failing
    reads_before_failure: Option<usize>,
    fail_writes: bool,
}

impl SimBus {
    /// A target answering `signature` at the default signature address
    pub fn new(signature: [u8; 3]) -> Self {
        Self::with_signature_at(SIGNATURE_ADDRESS, signature)
    }

    pub fn with_signature_at(address: u32, signature: [u8; 3]) -> Self {
        let mut bus = SimBus::default();
        bus.load(address, &signature);
        bus
    }

    pub fn for_part(part: &PartDescriptor) -> Self {
        Self::new(part.signature)
    }

    /// Place bytes in target memory without going through the bus
    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    /// Make reads of `address` return `value`, whatever was written
    pub fn corrupt_read(mut self, address: u32, value: u8) -> Self {
        self.corrupt.insert(address, value);
        self
    }

    /// Chip erase completes but reports a timeout, like real silicon can
    pub fn chip_erase_times_out(mut self) -> Self {
        self.chip_erase_timeout = true;
        self
    }

    /// Let `n` reads succeed, fail every read after that
    pub fn fail_reads_after(mut self, n: usize) -> Self {
        self.reads_before_failure = Some(n);
        self
    }

    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn is_programming(&self) -> bool {
        self.programming
    }

    pub fn timeout_ms(&self) -> Option<u16> {
        self.timeout_ms
    }

    pub fn selected_part(&self) -> Option<&PartDescriptor> {
        self.selected.as_ref()
    }

    /// Target memory as stored, without injected corruption
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.byte_at(address + i as u32))
            .collect()
    }

    fn byte_at(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0xff)
    }

    fn ready(&self, what: &str) -> Result<()> {
        if !self.programming {
            return Err(anyhow::format_err!("{}: programming mode not enabled", what).into());
        }
        if self.stalled {
            return Err(anyhow::format_err!("{}: PDI not responding", what).into());
        }
        Ok(())
    }

    fn erase_range(&mut self, start: u32, end: u32) {
        let keys: Vec<u32> = self.memory.range(start..end).map(|(k, _)| *k).collect();
        for k in keys {
            self.memory.remove(&k);
        }
    }
}

impl PdiBus for SimBus {
    fn set_timeout(&mut self, timeout_ms: u16) -> Result<()> {
        self.calls.set_timeout += 1;
        self.timeout_ms = Some(timeout_ms);
        Ok(())
    }

    fn enable_programming_mode(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.calls.enable += 1;
        } else {
            self.calls.disable += 1;
            self.stalled = false;
        }
        self.programming = enable;
        Ok(())
    }

    fn select_part(&mut self, part: &PartDescriptor) -> Result<()> {
        self.calls.select_part += 1;
        self.selected = Some(part.clone());
        Ok(())
    }

    fn read_memory(
        &mut self,
        _part: &PartDescriptor,
        address: u32,
        len: usize,
        _region: &str,
    ) -> Result<Vec<u8>> {
        self.calls.read += 1;
        self.ready("read")?;
        if let Some(left) = self.reads_before_failure.as_mut() {
            if *left == 0 {
                return Err(anyhow::format_err!("read at 0x{:08x}: pipe error", address).into());
            }
            *left -= 1;
        }
        Ok((0..len)
            .map(|i| {
                let addr = address + i as u32;
                self.corrupt
                    .get(&addr)
                    .copied()
                    .unwrap_or_else(|| self.byte_at(addr))
            })
            .collect())
    }

    fn write_memory(
        &mut self,
        _part: &PartDescriptor,
        address: u32,
        data: &[u8],
        _region: &str,
    ) -> Result<()> {
        self.calls.write += 1;
        self.ready("write")?;
        if self.fail_writes {
            return Err(anyhow::format_err!("write at 0x{:08x}: pipe error", address).into());
        }
        self.load(address, data);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.calls.erase_chip += 1;
        self.ready("erase chip")?;
        self.erase_range(0, DATA_SPACE);
        if self.chip_erase_timeout {
            self.stalled = true;
            return Err(BusError::Timeout("erase chip".to_string()));
        }
        Ok(())
    }

    fn erase_app(&mut self) -> Result<()> {
        self.calls.erase_app += 1;
        self.ready("erase app")?;
        let app = self
            .selected
            .as_ref()
            .and_then(|p| p.region("app").copied())
            .ok_or_else(|| anyhow::format_err!("erase app: part has no app section"))?;
        self.erase_range(app.offset, app.end());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PartDb;

    #[test]
    fn echoes_writes_and_applies_corruption() {
        let db = PartDb::load().unwrap();
        let part = db.find_by_name("ATxmega128A4U").unwrap();
        let mut bus = SimBus::for_part(part).corrupt_read(0x0080_0002, 0x00);
        bus.enable_programming_mode(true).unwrap();
        bus.write_memory(part, 0x0080_0000, &[1, 2, 3, 4], "flash")
            .unwrap();
        assert_eq!(
            bus.read_memory(part, 0x0080_0000, 5, "flash").unwrap(),
            [1, 2, 0, 4, 0xff]
        );
        assert_eq!(bus.peek(0x0080_0000, 4), [1, 2, 3, 4]);
        assert_eq!(
            bus.read_memory(part, SIGNATURE_ADDRESS, 3, "signature")
                .unwrap(),
            [0x1e, 0x97, 0x46]
        );
    }

    #[test]
    fn chip_erase_timeout_needs_mode_cycle() {
        let mut bus = SimBus::new([0x1e, 0x97, 0x46]).chip_erase_times_out();
        bus.enable_programming_mode(true).unwrap();
        bus.load(0x0080_0000, &[0x12]);
        assert!(matches!(bus.erase_chip(), Err(BusError::Timeout(_))));
        assert_eq!(bus.peek(0x0080_0000, 1), [0xff]);
        assert_eq!(bus.peek(SIGNATURE_ADDRESS, 1), [0x1e]);

        let part = PartDb::load().unwrap().parts().next().cloned().unwrap();
        assert!(bus.read_memory(&part, 0x0080_0000, 1, "flash").is_err());
        bus.enable_programming_mode(false).unwrap();
        bus.enable_programming_mode(true).unwrap();
        assert!(bus.read_memory(&part, 0x0080_0000, 1, "flash").is_ok());
    }

    #[test]
    fn app_erase_keeps_boot_section() {
        let db = PartDb::load().unwrap();
        let part = db.find_by_name("ATxmega16A4U").unwrap();
        let boot = *part.region("boot").unwrap();
        let mut bus = SimBus::for_part(part);
        bus.select_part(part).unwrap();
        bus.enable_programming_mode(true).unwrap();
        bus.load(0x0080_0010, &[0x55]);
        bus.load(boot.offset, &[0xaa]);
        bus.erase_app().unwrap();
        assert_eq!(bus.peek(0x0080_0010, 1), [0xff]);
        assert_eq!(bus.peek(boot.offset, 1), [0xaa]);
    }

    #[test]
    fn memory_access_requires_programming_mode() {
        let mut bus = SimBus::new([0; 3]);
        assert!(bus.erase_chip().is_err());
        assert_eq!(bus.calls().erase_chip, 1);
    }
}
