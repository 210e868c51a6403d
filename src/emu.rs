//! Register-level emulation of the retimer's EEPROM path, for tests.
//!
//! Implements just enough of the device to exercise the write/verify
//! pipeline without hardware: page/address registers, the holding window,
//! the Main Micro block commands and the bank checksum engine. The status
//! registers always read ready.

use crate::i2c::I2cBus;
use crate::image::MAX_IMAGE_SIZE;
use crate::retimer::regs::*;
use crate::retimer::Revision;

pub struct EmuRetimer {
	regs: &'static RegMap,
	pub eeprom: Vec<u8>,
	page: u8,
	addr: u16,
	holding: [u8; IM_DATA_WINDOW],
	holding_len: usize,
	checksum: [u8; 4],
	fw: [u8; 4],
	heartbeat: u8,
	alive: bool,
	lock_count: u32,
	/// reads at these addresses return the override instead of the cell,
	/// emulating a stuck EEPROM byte
	pub stuck_reads: Vec<(usize, u8)>,
	/// number of page register writes seen
	pub page_selects: u32,
	/// number of EEPROM bytes written through any command
	pub eeprom_writes: u32,
}

impl EmuRetimer {
	pub fn new(revision: Revision, fw: (u8, u8, u16), alive: bool) -> EmuRetimer {
		EmuRetimer {
			regs: revision.regs(),
			eeprom: vec![0xff; MAX_IMAGE_SIZE],
			page: 0,
			addr: 0,
			holding: [0; IM_DATA_WINDOW],
			holding_len: 0,
			checksum: [0; 4],
			fw: [fw.0, fw.1, (fw.2 >> 8) as u8, fw.2 as u8],
			heartbeat: 0,
			alive,
			lock_count: 0,
			stuck_reads: Vec::new(),
			page_selects: 0,
			eeprom_writes: 0,
		}
	}

	fn pointer(&self) -> usize {
		((self.page as usize) << 16) | self.addr as usize
	}

	fn read_cell(&self, address: usize) -> u8 {
		for (stuck, value) in &self.stuck_reads {
			if *stuck == address {
				return *value;
			}
		}
		self.eeprom[address]
	}

	fn exec(&mut self, cmd: u8) {
		let base = self.pointer();
		match cmd & 0x0f {
			IM_CMD_WRITE => {
				let n = self.holding_len;
				self.eeprom[base..base + n].copy_from_slice(&self.holding[..n]);
				self.eeprom_writes += n as u32;
				self.addr = self.addr.wrapping_add(n as u16);
				self.holding_len = 0;
			},
			IM_CMD_READ => {
				let n = self.holding[0] as usize;
				assert!(n <= IM_DATA_WINDOW);
				for i in 0..n {
					self.holding[i] = self.read_cell(base + i);
				}
				self.addr = self.addr.wrapping_add(n as u16);
			},
			IM_CMD_CHECKSUM => {
				// the engine reads through the same cells as byte reads,
				// so stuck cells poison the sum too
				let bank = (self.page as usize) << 16;
				let mut sum = 0u32;
				for address in bank..bank + 65536 {
					sum = sum.wrapping_add(self.read_cell(address) as u32);
				}
				self.checksum = [
					sum as u8,
					(sum >> 8) as u8,
					(sum >> 16) as u8,
					(sum >> 24) as u8,
				];
			},
			IM_CMD_LEGACY_WRITE => {
				self.eeprom[base] = self.holding[0];
				self.eeprom_writes += 1;
			},
			IM_CMD_LEGACY_READ => {
				self.holding[0] = self.read_cell(base);
			},
			other => panic!("emu: unknown I2C master command 0x{:02x}", other),
		}
	}
}

impl I2cBus for EmuRetimer {
	fn describe(&self) -> String {
		"emu".into()
	}

	fn write_block(&mut self, reg: u16, data: &[u8]) -> crate::AResult<()> {
		assert!(!data.is_empty());
		let regs = self.regs;
		if reg == regs.im_page {
			self.page = data[0];
			self.page_selects += 1;
		} else if reg == regs.im_addr {
			assert_eq!(data.len(), 2);
			self.addr = ((data[0] as u16) << 8) | data[1] as u16;
		} else if reg == regs.im_data {
			assert!(data.len() <= IM_DATA_WINDOW);
			self.holding[..data.len()].copy_from_slice(data);
			self.holding_len = data.len();
		} else if reg == regs.im_cmd {
			self.exec(data[0]);
		} else if reg == regs.hw_reset || reg == regs.sw_reset || reg == regs.im_bitbang {
			// reset and bit-bang pokes have no observable effect here
		} else {
			panic!("emu: write to unknown reg 0x{:04x}", reg);
		}
		Ok(())
	}

	fn read_block(&mut self, reg: u16, buf: &mut [u8]) -> crate::AResult<()> {
		assert!(!buf.is_empty());
		let regs = self.regs;
		if reg == regs.fw_version {
			buf.copy_from_slice(&self.fw[..buf.len()]);
		} else if reg == regs.mm_heartbeat {
			if self.alive {
				self.heartbeat = self.heartbeat.wrapping_add(1);
			}
			buf[0] = self.heartbeat;
		} else if reg == regs.im_status || reg == regs.im_cksum_status {
			// always ready
			for b in buf.iter_mut() {
				*b = 0;
			}
		} else if reg == regs.im_cksum {
			buf.copy_from_slice(&self.checksum[..buf.len()]);
		} else if reg == regs.im_data {
			buf.copy_from_slice(&self.holding[..buf.len()]);
		} else {
			panic!("emu: read from unknown reg 0x{:04x}", reg);
		}
		Ok(())
	}

	fn lock(&mut self) {
		self.lock_count += 1;
	}

	fn unlock(&mut self) {
		assert!(self.lock_count > 0, "emu: unbalanced unlock");
		self.lock_count -= 1;
	}
}
