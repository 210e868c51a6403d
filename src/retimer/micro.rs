//! Main-Micro-assisted EEPROM transfers.
//!
//! The EEPROM sits behind the retimer's own I2C master. With a live Main
//! Micro firmware, blocks are staged into a holding register window and
//! handed over with a command byte; the status register clears once the
//! micro consumed them. With the micro held in reset ("legacy"), single
//! bytes are pushed through the master registers directly, paced by the
//! EEPROM write cycle instead of status polling.

use crate::i2c::I2cBus;

use super::regs::*;
use super::{
	Retimer,
	RetimerError,
};

/// status poll budget for block commands
const STATUS_POLL_TRIES: u32 = 30;
/// the bank checksum takes the micro much longer than a block transfer
const CHECKSUM_POLL_TRIES: u32 = 500;

impl<B: I2cBus> Retimer<B> {
	pub(crate) fn regs(&self) -> &'static RegMap {
		self.revision().regs()
	}

	/// Run `f` with the advisory bus lock held (paired transfers that other
	/// traffic must not interleave with).
	fn locked<R, F>(&mut self, f: F) -> crate::AResult<R>
	where
		F: FnOnce(&mut Self) -> crate::AResult<R>,
	{
		self.bus.lock();
		let result = f(self);
		self.bus.unlock();
		result
	}

	/// Select the 64 KiB page a 24-bit EEPROM address lives in. Only hits
	/// the wire when the page actually changes; there is no read-back, so
	/// any other actor poking the device invalidates the cache silently.
	pub(crate) fn set_page(&mut self, page: u8) -> crate::AResult<()> {
		if self.current_page == Some(page) {
			return Ok(());
		}
		self.bus.write_byte(self.regs().im_page, page)?;
		self.current_page = Some(page);
		Ok(())
	}

	fn set_burst_address(&mut self, offset: u16) -> crate::AResult<()> {
		self.bus.write_block(self.regs().im_addr, &[(offset >> 8) as u8, offset as u8])
	}

	fn poll_ready(&mut self, reg: u16, tries: u32) -> crate::AResult<()> {
		for _ in 0..tries {
			if 0 == self.bus.read_byte(reg)? {
				return Ok(());
			}
			self.sleep(self.timing().poll_interval);
		}
		Err(RetimerError::MicroBusy { reg }.into())
	}

	fn block_command(&self, op: u8, last: bool) -> u8 {
		let mut cmd = op | if last { IM_FLAG_END } else { IM_FLAG_MORE };
		if self.geometry().cmd_modifier {
			cmd |= IM_CMD_MODIFIER;
		}
		cmd
	}

	/// Write one burst (caller selected page and burst address; must not
	/// cross a page boundary). Stages block-sized chunks and waits for the
	/// micro to consume each one; the micro advances its write pointer per
	/// consumed block.
	pub(crate) fn assisted_burst_write(&mut self, data: &[u8]) -> crate::AResult<()> {
		debug_assert!(data.len() <= self.geometry().max_burst);
		let block_size = self.geometry().block_size;
		let blocks = data.chunks(block_size).count();

		for (i, block) in data.chunks(block_size).enumerate() {
			let regs = self.regs();
			self.bus.write_block(regs.im_data, block)?;
			let cmd = self.block_command(IM_CMD_WRITE, i + 1 == blocks);
			self.bus.write_byte(regs.im_cmd, cmd)?;
			self.poll_ready(regs.im_status, STATUS_POLL_TRIES)?;
		}
		Ok(())
	}

	/// Read back one block of a burst into `buf` (up to the block size).
	/// The requested length goes through the first holding register; the
	/// micro advances its read pointer by that much.
	fn assisted_block_read(&mut self, buf: &mut [u8]) -> crate::AResult<()> {
		debug_assert!(buf.len() <= self.geometry().block_size);
		self.locked(|rt| {
			let regs = rt.regs();
			rt.bus.write_byte(regs.im_data, buf.len() as u8)?;
			let cmd = rt.block_command(IM_CMD_READ, true);
			rt.bus.write_byte(regs.im_cmd, cmd)?;
			rt.poll_ready(regs.im_status, STATUS_POLL_TRIES)?;
			rt.bus.read_block(regs.im_data, buf)
		})
	}

	/// Running sum the Main Micro computed over one 64 KiB bank.
	pub fn bank_checksum(&mut self, bank: u8) -> crate::AResult<u32> {
		self.set_page(bank)?;
		self.locked(|rt| {
			let regs = rt.regs();
			rt.bus.write_byte(regs.im_cmd, IM_CMD_CHECKSUM | IM_FLAG_END)?;
			rt.poll_ready(regs.im_cksum_status, CHECKSUM_POLL_TRIES)
				.map_err(|_| RetimerError::ChecksumTimeout { bank })?;
			let mut raw = [0u8; 4];
			rt.bus.read_block(regs.im_cksum, &mut raw)?;
			Ok((raw[0] as u32)
				| (raw[1] as u32) << 8
				| (raw[2] as u32) << 16
				| (raw[3] as u32) << 24)
		})
	}

	fn legacy_send_byte(&mut self, offset: u16, value: u8) -> crate::AResult<()> {
		self.set_burst_address(offset)?;
		let regs = self.regs();
		self.bus.write_byte(regs.im_data, value)?;
		self.bus.write_byte(regs.im_cmd, IM_CMD_LEGACY_WRITE)?;
		// no status to poll with the micro in reset, pace by write cycle
		self.sleep(self.timing().write_cycle);
		Ok(())
	}

	fn legacy_receive_byte(&mut self, offset: u16) -> crate::AResult<u8> {
		self.set_burst_address(offset)?;
		self.locked(|rt| {
			let regs = rt.regs();
			rt.bus.write_byte(regs.im_cmd, IM_CMD_LEGACY_READ)?;
			rt.sleep(rt.timing().poll_interval);
			rt.bus.read_byte(regs.im_data)
		})
	}

	/// Program one burst at a 24-bit EEPROM address (must not cross a page
	/// boundary), on whichever path the handle is in.
	pub(crate) fn write_region(&mut self, address: usize, data: &[u8]) -> crate::AResult<()> {
		let bank_size = self.geometry().bank_size;
		debug_assert!(address % bank_size + data.len() <= bank_size);
		self.set_page((address / bank_size) as u8)?;
		let offset = (address % bank_size) as u16;

		if self.is_legacy() {
			for (i, b) in data.iter().enumerate() {
				self.legacy_send_byte(offset + i as u16, *b)?;
			}
			Ok(())
		} else {
			self.set_burst_address(offset)?;
			self.assisted_burst_write(data)
		}
	}

	/// Read one burst at a 24-bit EEPROM address into `buf`.
	pub(crate) fn read_region(&mut self, address: usize, buf: &mut [u8]) -> crate::AResult<()> {
		let bank_size = self.geometry().bank_size;
		debug_assert!(address % bank_size + buf.len() <= bank_size);
		self.set_page((address / bank_size) as u8)?;
		let offset = (address % bank_size) as u16;

		if self.is_legacy() {
			for (i, b) in buf.iter_mut().enumerate() {
				*b = self.legacy_receive_byte(offset + i as u16)?;
			}
			Ok(())
		} else {
			self.set_burst_address(offset)?;
			let block_size = self.geometry().block_size;
			for block in buf.chunks_mut(block_size) {
				self.assisted_block_read(block)?;
			}
			Ok(())
		}
	}

	/// Reprogram a single byte (used by the verify repair and the delta
	/// writer).
	pub(crate) fn rewrite_byte(&mut self, address: usize, value: u8) -> crate::AResult<()> {
		let bank_size = self.geometry().bank_size;
		self.set_page((address / bank_size) as u8)?;
		let offset = (address % bank_size) as u16;

		if self.is_legacy() {
			self.legacy_send_byte(offset, value)
		} else {
			self.set_burst_address(offset)?;
			self.assisted_burst_write(&[value])?;
			self.sleep(self.timing().write_cycle);
			Ok(())
		}
	}

	/// Read a single byte back.
	pub(crate) fn read_byte_at(&mut self, address: usize) -> crate::AResult<u8> {
		let mut buf = [0u8; 1];
		self.read_region(address, &mut buf)?;
		Ok(buf[0])
	}

	/// De-assert the device resets for programming. Legacy mode holds the
	/// Main Micro in reset so it can't race us on its own I2C master.
	pub(crate) fn enter_programming(&mut self) -> crate::AResult<()> {
		let regs = self.regs();
		self.bus.write_byte(regs.hw_reset, 0)?;
		let sw = if self.is_legacy() { SW_RESET_MAIN_MICRO } else { 0 };
		self.bus.write_byte(regs.sw_reset, sw)?;
		self.sleep(self.timing().reset_settle);
		Ok(())
	}

	/// Pulse the code-load reset so the device boots from the new image,
	/// and release the Main Micro again.
	pub(crate) fn leave_programming(&mut self) -> crate::AResult<()> {
		let regs = self.regs();
		self.bus.write_byte(regs.sw_reset, SW_RESET_CODE_LOAD)?;
		self.sleep(self.timing().reset_settle);
		self.bus.write_byte(regs.sw_reset, 0)?;
		Ok(())
	}

	/// Recover the I2C master state machine with a bit-banged START, nine
	/// clock pulses and a STOP. Used before programming because the normal
	/// register path may be wedged mid-transaction.
	pub(crate) fn soft_reset_master(&mut self) -> crate::AResult<()> {
		let bb = self.regs().im_bitbang;
		let mut step = |rt: &mut Self, pins: u8| -> crate::AResult<()> {
			rt.bus.write_byte(bb, BB_ENABLE | pins)?;
			rt.sleep(rt.timing().bit_delay);
			Ok(())
		};

		// START: SDA falls while SCL high
		step(self, BB_SCL | BB_SDA)?;
		step(self, BB_SCL)?;
		// nine clocks with SDA released, so a half-read slave lets go
		for _ in 0..9 {
			step(self, BB_SDA)?;
			step(self, BB_SCL | BB_SDA)?;
		}
		// STOP: SDA rises while SCL high
		step(self, BB_SCL)?;
		step(self, BB_SCL | BB_SDA)?;
		self.bus.write_byte(bb, 0)?;

		// whatever the master thought its page was is void now
		self.current_page = None;
		Ok(())
	}
}
