#![allow(dead_code)]
use std::str;

/// Retimer register map.
///
/// The two supported silicon revisions carry the same register blocks at
/// different offsets; the right table is picked at init time so one binary
/// can drive both.
pub struct RegMap {
	/// 4 bytes: major, minor, build (big-endian u16)
	pub fw_version: u16,
	/// Main Micro heartbeat counter, increments while the firmware runs
	pub mm_heartbeat: u16,
	/// hardware reset control, bit 0 asserts
	pub hw_reset: u16,
	/// software reset control, see `SW_RESET_*`
	pub sw_reset: u16,

	// I2C master (EEPROM pass-through) block
	/// command register, see `IM_CMD_*` / `IM_FLAG_*`
	pub im_cmd: u16,
	/// status register; 0 once the Main Micro consumed the command
	pub im_status: u16,
	/// 64 KiB page select for the 24-bit EEPROM address space
	pub im_page: u16,
	/// 2 bytes big-endian: burst start offset within the selected page
	pub im_addr: u16,
	/// data holding window, `IM_DATA_WINDOW` bytes
	pub im_data: u16,
	/// checksum engine status; 0 when the bank sum is ready
	pub im_cksum_status: u16,
	/// 4 bytes little-endian: running sum of the selected bank
	pub im_cksum: u16,
	/// bit-bang control for recovering the master state machine
	pub im_bitbang: u16,
}

pub const IM_DATA_WINDOW: usize = 32;

const A0: RegMap = RegMap {
	fw_version: 0x0410,
	mm_heartbeat: 0x0423,
	hw_reset: 0x0600,
	sw_reset: 0x0602,
	im_cmd: 0x0d00,
	im_status: 0x0d01,
	im_page: 0x0d02,
	im_addr: 0x0d04,
	im_cksum_status: 0x0d08,
	im_cksum: 0x0d0a,
	im_bitbang: 0x0d0f,
	im_data: 0x0d10,
};

const MPW: RegMap = RegMap {
	fw_version: 0x0510,
	mm_heartbeat: 0x0523,
	hw_reset: 0x0700,
	sw_reset: 0x0702,
	im_cmd: 0x0e00,
	im_status: 0x0e01,
	im_page: 0x0e02,
	im_addr: 0x0e04,
	im_cksum_status: 0x0e08,
	im_cksum: 0x0e0a,
	im_bitbang: 0x0e0f,
	im_data: 0x0e10,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Revision {
	A0,
	Mpw,
}

impl Revision {
	pub fn regs(self) -> &'static RegMap {
		match self {
			Revision::A0 => &A0,
			Revision::Mpw => &MPW,
		}
	}
}

impl str::FromStr for Revision {
	type Err = ::failure::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"a0" | "A0" => Ok(Revision::A0),
			"mpw" | "MPW" => Ok(Revision::Mpw),
			_ => bail!("unknown silicon revision {:?} (expected a0 or mpw)", s),
		}
	}
}

// I2C master command encoding: low nibble selects the operation, the flags
// tell the Main Micro whether more blocks of the current burst follow.
pub const IM_CMD_WRITE:        u8 = 0x01;
pub const IM_CMD_READ:         u8 = 0x02;
pub const IM_CMD_CHECKSUM:     u8 = 0x03;
/// legacy path: direct EEPROM byte write, Main Micro held in reset
pub const IM_CMD_LEGACY_WRITE: u8 = 0x05;
/// legacy path: direct EEPROM byte read into the first holding register
pub const IM_CMD_LEGACY_READ:  u8 = 0x06;

pub const IM_FLAG_MORE:        u8 = 0x10;
pub const IM_FLAG_END:         u8 = 0x20;
/// block-transfer modifier, required by firmware that uses 32-byte blocks
pub const IM_CMD_MODIFIER:     u8 = 0x40;

// sw_reset bits
pub const SW_RESET_CODE_LOAD:  u8 = 0x01;
pub const SW_RESET_MAIN_MICRO: u8 = 0x02;

// hw_reset bits
pub const HW_RESET_ASSERT:     u8 = 0x01;

// im_bitbang bits
pub const BB_SDA:              u8 = 0x01;
pub const BB_SCL:              u8 = 0x02;
pub const BB_ENABLE:           u8 = 0x04;
