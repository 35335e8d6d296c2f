//! The XPROG command set spoken by the ChipWhisperer-Lite XMEGA programmer

use std::fmt;

use anyhow::Result;
use scroll::{LE, Pwrite};

use crate::constants::{commands, params, status};

/// Programmer parameter, set with `Command::SetParam`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    /// Base address of the NVM controller registers
    NvmBase(u32),
    EepromPageSize(u16),
    /// PDI response timeout in milliseconds
    Timeout(u16),
}

/// XPROG Command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Enable PDI and put the target in programming mode
    EnterProgmode,
    /// Release the target, PDI is disabled afterwards
    LeaveProgmode,
    /// Erase a memory section. `address` is only used by page erases.
    Erase { erase_type: u8, address: u32 },
    /// Commit the staged RAM buffer to `address`.
    ///
    /// `page_mode` selects erase and/or write of the page.
    WriteMem {
        mem_type: u8,
        page_mode: u8,
        address: u32,
        len: u16,
    },
    /// Read into the RAM buffer, fetched afterwards with `GET_RAMBUF`
    ReadMem { mem_type: u8, address: u32, len: u16 },
    SetParam(Param),
}

impl Command {
    pub fn erase(erase_type: u8) -> Self {
        Command::Erase {
            erase_type,
            address: 0,
        }
    }

    pub fn write_mem(mem_type: u8, page_mode: u8, address: u32, len: u16) -> Self {
        Command::WriteMem {
            mem_type,
            page_mode,
            address,
            len,
        }
    }

    pub fn read_mem(mem_type: u8, address: u32, len: u16) -> Self {
        Command::ReadMem {
            mem_type,
            address,
            len,
        }
    }

    pub fn set_param(param: Param) -> Self {
        Command::SetParam(param)
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::EnterProgmode => commands::ENTER_PROGMODE,
            Command::LeaveProgmode => commands::LEAVE_PROGMODE,
            Command::Erase { .. } => commands::ERASE,
            Command::WriteMem { .. } => commands::WRITE_MEM,
            Command::ReadMem { .. } => commands::READ_MEM,
            Command::SetParam(_) => commands::SET_PARAM,
        }
    }

    /// Encode as `[opcode, payload..]`, multi-byte fields little endian
    pub fn into_raw(self) -> Result<Vec<u8>> {
        let opcode = self.opcode();
        match self {
            Command::EnterProgmode | Command::LeaveProgmode => Ok(vec![opcode]),
            Command::Erase {
                erase_type,
                address,
            } => {
                let mut buf = [opcode, erase_type, 0, 0, 0, 0];
                buf.pwrite_with(address, 2, LE)?;
                Ok(buf.to_vec())
            }
            Command::WriteMem {
                mem_type,
                page_mode,
                address,
                len,
            } => {
                // CMD, MEMTYPE, MODE, ADDR, LEN
                let mut buf = [0u8; 1 + 1 + 1 + 4 + 2];
                buf[0] = opcode;
                buf[1] = mem_type;
                buf[2] = page_mode;
                buf.pwrite_with(address, 3, LE)?;
                buf.pwrite_with(len, 7, LE)?;
                Ok(buf.to_vec())
            }
            Command::ReadMem {
                mem_type,
                address,
                len,
            } => {
                let mut buf = [0u8; 1 + 1 + 4 + 2];
                buf[0] = opcode;
                buf[1] = mem_type;
                buf.pwrite_with(address, 2, LE)?;
                buf.pwrite_with(len, 6, LE)?;
                Ok(buf.to_vec())
            }
            Command::SetParam(param) => match param {
                Param::NvmBase(base) => {
                    let mut buf = [opcode, params::NVMBASE, 0, 0, 0, 0];
                    buf.pwrite_with(base, 2, LE)?;
                    Ok(buf.to_vec())
                }
                Param::EepromPageSize(size) => {
                    let mut buf = [opcode, params::EEPPAGESIZE, 0, 0];
                    buf.pwrite_with(size, 2, LE)?;
                    Ok(buf.to_vec())
                }
                Param::Timeout(ms) => {
                    let mut buf = [opcode, params::TIMEOUT, 0, 0];
                    buf.pwrite_with(ms, 2, LE)?;
                    Ok(buf.to_vec())
                }
            },
        }
    }
}

/// Status of the last command, read back after every request
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    /// Echo of the opcode this status belongs to
    pub command: u8,
    pub code: u8,
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.code {
            status::OK => "OK",
            status::FAILED => "FAILED",
            status::COLLISION => "COLLISION",
            status::TIMEOUT => "TIMEOUT",
            _ => "UNKNOWN",
        };
        write!(f, "{}[{:02x}]({:02x})", code, self.command, self.code)
    }
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == status::OK
    }

    pub fn is_timeout(&self) -> bool {
        self.code == status::TIMEOUT
    }

    pub(crate) fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw {
            [command, code, ..] => Ok(Status {
                command: *command,
                code: *code,
            }),
            _ => Err(anyhow::anyhow!("Invalid status length {}", raw.len())),
        }
    }
}
