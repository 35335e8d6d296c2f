/// ChipWhisperer-Lite USB ids
pub const USB_VENDOR_ID: u16 = 0x2b3e;
pub const USB_PRODUCT_ID: u16 = 0xace2;

/// Largest chunk moved by a single control transfer
pub const MAX_PACKET_SIZE: usize = 64;

/// Device-side staging buffer, flash pages larger than this are not supported
pub const MAX_RAMBUF_SIZE: usize = 512;

/// Page size used when the selected region doesn't specify one
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// PDI address of the 3 device signature bytes
pub const SIGNATURE_ADDRESS: u32 = 0x0100_0090;
pub const SIGNATURE_LEN: usize = 3;

/// Bus response timeout used while programming, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u16 = 200;

/// NVM controller base address in the PDI data space
pub const NVM_BASE: u32 = 0x0100_01c0;

/// Vendor request carrying all XMEGA programming commands
pub const REQ_XMEGA_PROGRAM: u8 = 0x20;

/// wValue selectors of the vendor request
pub mod request {
    pub const GET_STATUS: u16 = 0x0020;
    pub const GET_RAMBUF: u16 = 0x0021;
    pub const SET_RAMBUF: u16 = 0x0022;
}

pub mod commands {
    pub const ENTER_PROGMODE: u8 = 0x01;
    pub const LEAVE_PROGMODE: u8 = 0x02;
    pub const ERASE: u8 = 0x03;
    pub const WRITE_MEM: u8 = 0x04;
    pub const READ_MEM: u8 = 0x05;
    pub const SET_PARAM: u8 = 0x07;
}

pub mod mem_types {
    pub const APPL: u8 = 0x01;
    pub const BOOT: u8 = 0x02;
    pub const EEPROM: u8 = 0x03;
    pub const FUSE: u8 = 0x04;
    pub const LOCKBITS: u8 = 0x05;
    pub const USERSIG: u8 = 0x06;
    pub const FACTORY_CALIBRATION: u8 = 0x07;
}

pub mod erase_types {
    pub const CHIP: u8 = 0x01;
    pub const APP: u8 = 0x02;
}

pub mod params {
    pub const NVMBASE: u8 = 0x01;
    pub const EEPPAGESIZE: u8 = 0x02;
    pub const TIMEOUT: u8 = 0x06;
}

pub mod page_mode {
    pub const ERASE: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
}

pub mod status {
    pub const OK: u8 = 0x00;
    pub const FAILED: u8 = 0x01;
    pub const COLLISION: u8 = 0x02;
    pub const TIMEOUT: u8 = 0x03;
}
