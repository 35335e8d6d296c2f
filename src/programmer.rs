//! XMEGA programming workflow: discovery, erase, program and verify.
//!
//! A [`Programmer`] borrows or owns one bus session and drives it strictly
//! sequentially. No operation can be interrupted, a blocking bus call only
//! ends by returning or failing.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::bus::PdiBus;
use crate::constants::{DEFAULT_TIMEOUT_MS, SIGNATURE_ADDRESS, SIGNATURE_LEN};
use crate::device::{MemoryRegion, PartDb, PartDescriptor};
use crate::error::{Error, Mismatch, Result};
use crate::format::{FileImageSource, FirmwareImage, ImageSource};

/// What to do when read-back differs from the written image
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// Any mismatch fails with `Error::VerifyFailed`
    #[default]
    Strict,
    /// Mismatches are logged and returned in the result
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammerConfig {
    /// PDI address of the signature bytes
    pub signature_address: u32,
    /// Bus response timeout set on discovery
    pub timeout_ms: u16,
    pub verify_policy: VerifyPolicy,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        ProgrammerConfig {
            signature_address: SIGNATURE_ADDRESS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verify_policy: VerifyPolicy::Strict,
        }
    }
}

/// Erase operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseTarget {
    /// Whole device
    Chip,
    /// Application section only
    App,
}

impl FromStr for EraseTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chip" => Ok(EraseTarget::Chip),
            "app" => Ok(EraseTarget::App),
            _ => Err(Error::InvalidArgument(format!("Invalid memtype: {}", s))),
        }
    }
}

impl fmt::Display for EraseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EraseTarget::Chip => write!(f, "chip"),
            EraseTarget::App => write!(f, "app"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub identified: bool,
    pub part_name: Option<String>,
    pub raw_signature: [u8; SIGNATURE_LEN],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramResult {
    pub bytes_written: usize,
    /// Every differing byte in address order, empty when verified or not verified
    pub mismatches: Vec<Mismatch>,
}

impl ProgramResult {
    pub fn is_verified(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub type StatusSink = Box<dyn FnMut(&str)>;

pub struct Programmer<B: PdiBus> {
    bus: B,
    parts: PartDb,
    config: ProgrammerConfig,
    images: Box<dyn ImageSource>,
    selected_part: PartDescriptor,
    /// `selected_part` has been pushed to the bus
    part_configured: bool,
    chip_identified: bool,
    status_sink: Option<StatusSink>,
    closed: bool,
}

impl<B: PdiBus> Programmer<B> {
    /// Start a session on `bus`. The first catalog entry is selected until
    /// `find` identifies the chip.
    pub fn attach(bus: B, parts: PartDb, config: ProgrammerConfig) -> Result<Self> {
        let selected_part = parts
            .parts()
            .next()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("part catalog is empty".to_string()))?;
        Ok(Programmer {
            bus,
            parts,
            config,
            images: Box::new(FileImageSource),
            selected_part,
            part_configured: false,
            chip_identified: false,
            status_sink: None,
            closed: false,
        })
    }

    pub fn with_image_source(mut self, images: impl ImageSource + 'static) -> Self {
        self.images = Box::new(images);
        self
    }

    pub fn with_status_sink(mut self, sink: impl FnMut(&str) + 'static) -> Self {
        self.set_status_sink(sink);
        self
    }

    pub fn set_status_sink(&mut self, sink: impl FnMut(&str) + 'static) {
        self.status_sink = Some(Box::new(sink));
    }

    pub fn selected_part(&self) -> &PartDescriptor {
        &self.selected_part
    }

    pub fn chip_identified(&self) -> bool {
        self.chip_identified
    }

    pub fn config(&self) -> &ProgrammerConfig {
        &self.config
    }

    /// Report status text. Never fails, a panicking sink is dropped.
    pub fn log(&mut self, text: &str) {
        match self.status_sink.as_mut() {
            None => log::info!("{}", text),
            Some(sink) => {
                if panic::catch_unwind(AssertUnwindSafe(|| sink(text))).is_err() {
                    log::warn!("status sink panicked, falling back to the log");
                    self.status_sink = None;
                    log::info!("{}", text);
                }
            }
        }
    }

    /// Identify the connected chip by its signature.
    ///
    /// Programming mode is enabled and left enabled. An unknown signature is
    /// not an error, only bus failures are.
    /// A failure while setting the timeout, enabling programming mode or
    /// reading the signature is returned as `Err`, no `DiscoveryResult` is made.
    pub fn find(&mut self) -> Result<DiscoveryResult> {
        self.chip_identified = false;

        self.bus.set_timeout(self.config.timeout_ms)?;
        self.bus.enable_programming_mode(true)?;

        let data = self.bus.read_memory(
            &self.selected_part,
            self.config.signature_address,
            SIGNATURE_LEN,
            "signature",
        )?;
        let raw_signature: [u8; SIGNATURE_LEN] = data.as_slice().try_into().map_err(|_| {
            Error::Bus(anyhow::format_err!(
                "signature read returned {} bytes",
                data.len()
            ))
        })?;

        match self.parts.find_by_signature(&raw_signature).cloned() {
            Some(part) => {
                self.log(&format!("Detected {}", part.name));
                self.bus.select_part(&part)?;
                self.part_configured = true;
                self.selected_part = part;
                self.chip_identified = true;
                Ok(DiscoveryResult {
                    identified: true,
                    part_name: Some(self.selected_part.name.clone()),
                    raw_signature,
                })
            }
            None => {
                self.log(&format!(
                    "Detected Unknown Chip, sig={:02x} {:02x} {:02x}",
                    raw_signature[0], raw_signature[1], raw_signature[2]
                ));
                Ok(DiscoveryResult {
                    identified: false,
                    part_name: None,
                    raw_signature,
                })
            }
        }
    }

    /// Erase by name, `"chip"` or `"app"`
    pub fn erase(&mut self, memtype: &str) -> Result<()> {
        let target = memtype.parse()?;
        self.erase_target(target)
    }

    /// Issue the erase command. A chip erase may report `Error::Timeout`,
    /// the bus then needs `cycle_programming_mode` before further use.
    pub fn erase_target(&mut self, target: EraseTarget) -> Result<()> {
        self.configure_part()?;
        match target {
            EraseTarget::Chip => self.bus.erase_chip()?,
            EraseTarget::App => self.bus.erase_app()?,
        }
        self.log(&format!("Erased {}", target));
        Ok(())
    }

    /// Leave and re-enter programming mode
    pub fn cycle_programming_mode(&mut self) -> Result<()> {
        self.bus.enable_programming_mode(false)?;
        self.bus.enable_programming_mode(true)?;
        Ok(())
    }

    /// Write the image at `path` to the `memtype` region, then optionally
    /// read it back and compare.
    pub fn program<P: AsRef<Path>>(
        &mut self,
        path: P,
        memtype: &str,
        verify: bool,
    ) -> Result<ProgramResult> {
        let path = path.as_ref();
        let (image, region) = self.prepare(path, memtype)?;
        let data = image.to_binary();

        self.log("Programming...");
        self.configure_part()?;
        self.bus
            .write_memory(&self.selected_part, region.offset, &data, memtype)?;

        if !verify {
            return Ok(ProgramResult {
                bytes_written: data.len(),
                mismatches: vec![],
            });
        }
        self.compare(path, memtype, &region, &data, data.len())
    }

    /// Compare the region against the image at `path` without writing
    pub fn verify<P: AsRef<Path>>(&mut self, path: P, memtype: &str) -> Result<ProgramResult> {
        let path = path.as_ref();
        let (image, region) = self.prepare(path, memtype)?;
        self.configure_part()?;
        self.compare(path, memtype, &region, &image.to_binary(), 0)
    }

    /// Read `len` bytes, or the whole region, from the start of `memtype`
    pub fn read_region(&mut self, memtype: &str, len: Option<usize>) -> Result<Vec<u8>> {
        let region = self.region(memtype)?;
        let len = len.unwrap_or(region.size as usize);
        if len > region.size as usize {
            return Err(Error::InvalidArgument(format!(
                "{} bytes requested, {} is only {} bytes",
                len, memtype, region.size
            )));
        }
        self.configure_part()?;
        Ok(self
            .bus
            .read_memory(&self.selected_part, region.offset, len, memtype)?)
    }

    /// Leave programming mode. Runs once, dropping the programmer does
    /// the same when `close` wasn't called.
    pub fn close(mut self) -> Result<()> {
        self.disable()
    }

    fn disable(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.bus.enable_programming_mode(false)?;
        log::debug!("Programming mode disabled");
        Ok(())
    }

    fn region(&self, memtype: &str) -> Result<MemoryRegion> {
        self.selected_part.region(memtype).copied().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} has no memory type {:?}",
                self.selected_part.name, memtype
            ))
        })
    }

    /// Load the image and check it fits, nothing is sent to the bus and the
    /// image is not flattened yet
    fn prepare(&self, path: &Path, memtype: &str) -> Result<(FirmwareImage, MemoryRegion)> {
        let image = self.images.load(path)?;
        let region = self.region(memtype)?;

        let capacity_exceeded = |size: usize| Error::CapacityExceeded {
            path: path.to_path_buf(),
            size,
            region: memtype.to_string(),
            capacity: region.size,
        };
        if image.size() > region.size as usize {
            return Err(capacity_exceeded(image.size()));
        }
        // the flat image starts at address 0, a high origin can push it past the end
        if image.binary_len() > region.size as usize {
            return Err(capacity_exceeded(image.binary_len()));
        }
        Ok((image, region))
    }

    fn configure_part(&mut self) -> Result<()> {
        if !self.part_configured {
            self.bus.select_part(&self.selected_part)?;
            self.part_configured = true;
        }
        Ok(())
    }

    fn compare(
        &mut self,
        path: &Path,
        memtype: &str,
        region: &MemoryRegion,
        expected: &[u8],
        bytes_written: usize,
    ) -> Result<ProgramResult> {
        self.log("Reading...");
        let actual =
            self.bus
                .read_memory(&self.selected_part, region.offset, expected.len(), memtype)?;
        if actual.len() != expected.len() {
            return Err(Error::Bus(anyhow::format_err!(
                "read back {} of {} bytes",
                actual.len(),
                expected.len()
            )));
        }

        let mismatches: Vec<Mismatch> = expected
            .iter()
            .zip(actual.iter())
            .enumerate()
            .filter(|(_, (e, a))| e != a)
            .map(|(index, (&expected, &actual))| Mismatch {
                index,
                expected,
                actual,
            })
            .collect();
        let result = ProgramResult {
            bytes_written,
            mismatches,
        };

        match result.mismatches.first() {
            None => {
                self.log("Verified OK");
                Ok(result)
            }
            Some(first) => {
                self.log(&format!(
                    "Verify failed at 0x{:04x}, {:02x} != {:02x} ({} bytes differ)",
                    first.index,
                    first.expected,
                    first.actual,
                    result.mismatches.len()
                ));
                match self.config.verify_policy {
                    VerifyPolicy::Lenient => Ok(result),
                    VerifyPolicy::Strict => Err(Error::VerifyFailed {
                        path: PathBuf::from(path),
                        region: memtype.to_string(),
                        bytes_written: result.bytes_written,
                        mismatches: result.mismatches,
                    }),
                }
            }
        }
    }
}

impl<B: PdiBus> Drop for Programmer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            log::warn!("Failed to leave programming mode: {}", e);
        }
    }
}

/// Erase with the timeout workaround: when the erase reports a bus
/// timeout, cycle programming mode and carry on.
///
/// Returns whether the workaround was needed.
pub fn erase_with_timeout_recovery<B: PdiBus>(
    programmer: &mut Programmer<B>,
    target: EraseTarget,
) -> Result<bool> {
    match programmer.erase_target(target) {
        Ok(()) => Ok(false),
        Err(e) if e.is_timeout() => {
            programmer.log(&format!("**{}-erase timeout, workaround enabled**", target));
            programmer.cycle_programming_mode()?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::sim::SimBus;

    #[test]
    fn erase_target_names() {
        assert_eq!("chip".parse::<EraseTarget>().unwrap(), EraseTarget::Chip);
        assert_eq!("app".parse::<EraseTarget>().unwrap(), EraseTarget::App);
        assert_eq!(EraseTarget::Chip.to_string(), "chip");
        assert_eq!(EraseTarget::App.to_string(), "app");
        assert!(matches!(
            "Chip".parse::<EraseTarget>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_config_uses_reference_constants() {
        let config = ProgrammerConfig::default();
        assert_eq!(config.signature_address, 0x0100_0090);
        assert_eq!(config.timeout_ms, 200);
        assert_eq!(config.verify_policy, VerifyPolicy::Strict);
    }

    #[test]
    fn status_goes_to_sink() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        let mut bus = SimBus::new([0x1e, 0x97, 0x46]);
        let mut prog = Programmer::attach(&mut bus, PartDb::load().unwrap(), Default::default())
            .unwrap()
            .with_status_sink(move |s: &str| sink.borrow_mut().push(s.to_string()));
        prog.find().unwrap();
        prog.close().unwrap();
        assert_eq!(*lines.borrow(), ["Detected ATxmega128A4U"]);
    }

    #[test]
    fn erase_status_names_the_target() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        let mut bus = SimBus::new([0x1e, 0x97, 0x46]);
        let mut prog = Programmer::attach(&mut bus, PartDb::load().unwrap(), Default::default())
            .unwrap()
            .with_status_sink(move |s: &str| sink.borrow_mut().push(s.to_string()));
        prog.find().unwrap();
        assert!(!erase_with_timeout_recovery(&mut prog, EraseTarget::App).unwrap());
        prog.close().unwrap();
        assert_eq!(*lines.borrow(), ["Detected ATxmega128A4U", "Erased app"]);
    }

    #[test]
    fn chip_erase_timeout_is_reported_to_sink() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        let mut bus = SimBus::new([0x1e, 0x97, 0x46]).chip_erase_times_out();
        let mut prog = Programmer::attach(&mut bus, PartDb::load().unwrap(), Default::default())
            .unwrap()
            .with_status_sink(move |s: &str| sink.borrow_mut().push(s.to_string()));
        prog.find().unwrap();
        assert!(erase_with_timeout_recovery(&mut prog, EraseTarget::Chip).unwrap());
        prog.close().unwrap();
        assert_eq!(
            *lines.borrow(),
            [
                "Detected ATxmega128A4U",
                "**chip-erase timeout, workaround enabled**"
            ]
        );
    }

    #[test]
    fn panicking_sink_is_swallowed() {
        let mut bus = SimBus::new([0x00, 0x00, 0x00]);
        let mut prog = Programmer::attach(&mut bus, PartDb::load().unwrap(), Default::default())
            .unwrap()
            .with_status_sink(|_: &str| panic!("sink broken"));
        let found = prog.find().unwrap();
        assert!(!found.identified);
        prog.log("still alive");
    }

    #[test]
    fn empty_catalog_is_rejected() {
        let mut bus = SimBus::new([0; 3]);
        assert!(matches!(
            Programmer::attach(&mut bus, PartDb::from_families(vec![]), Default::default()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
