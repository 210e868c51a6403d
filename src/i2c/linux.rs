use std::fs;
use std::io::{
	Read,
	Write,
};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::pec::pec_byte;

use super::I2cBus;

// from linux/i2c-dev.h
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// A retimer on a Linux i2c-dev bus (`/dev/i2c-N`).
pub struct LinuxI2c {
	file: fs::File,
	path: String,
	addr: u16,
	pec: bool,
	lock_count: u32,
}

/// Open `/dev/i2c-N` and bind the slave address via `ioctl(I2C_SLAVE)`.
pub fn open_bus<P: AsRef<Path>>(path: P, addr: u16, pec: bool) -> crate::AResult<LinuxI2c> {
	let path = path.as_ref();
	ensure!(addr <= 0x7f, "invalid 7-bit I2C slave address 0x{:x}", addr);

	with_context!(("couldn't open I2C bus {:?} slave 0x{:02x}", path, addr), {
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.open(path)?;

		let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, addr as libc::c_ulong) };
		if rc < 0 {
			return Err(std::io::Error::last_os_error().into());
		}

		Ok(LinuxI2c {
			file,
			path: path.to_string_lossy().into_owned(),
			addr,
			pec,
			lock_count: 0,
		})
	})
}

impl I2cBus for LinuxI2c {
	fn describe(&self) -> String {
		format!("{}@0x{:02x}", self.path, self.addr)
	}

	fn write_block(&mut self, reg: u16, data: &[u8]) -> crate::AResult<()> {
		let mut frame = Vec::with_capacity(data.len() + 3);
		frame.push((reg >> 8) as u8);
		frame.push(reg as u8);
		frame.extend_from_slice(data);
		if self.pec {
			// PEC covers the addressed slave (write direction) and the frame
			let mut covered = Vec::with_capacity(frame.len() + 1);
			covered.push((self.addr << 1) as u8);
			covered.extend_from_slice(&frame);
			frame.push(pec_byte(&covered));
		}

		with_context!(("{}: write reg 0x{:04x} ({} bytes)", self.describe(), reg, data.len()), {
			self.file.write_all(&frame)?;
			Ok(())
		})
	}

	fn read_block(&mut self, reg: u16, buf: &mut [u8]) -> crate::AResult<()> {
		// a register read is the address write followed by the data read;
		// keep the pair together
		self.lock();
		let result = self.read_block_inner(reg, buf);
		self.unlock();
		result
	}

	fn lock(&mut self) {
		self.lock_count += 1;
	}

	fn unlock(&mut self) {
		debug_assert!(self.lock_count > 0);
		self.lock_count = self.lock_count.saturating_sub(1);
	}
}

impl LinuxI2c {
	fn read_block_inner(&mut self, reg: u16, buf: &mut [u8]) -> crate::AResult<()> {
		with_context!(("{}: read reg 0x{:04x} ({} bytes)", self.describe(), reg, buf.len()), {
			let addr_frame = [(reg >> 8) as u8, reg as u8];
			self.file.write_all(&addr_frame)?;

			if !self.pec {
				self.file.read_exact(buf)?;
				return Ok(());
			}

			let mut raw = vec![0u8; buf.len() + 1];
			self.file.read_exact(&mut raw)?;

			// PEC covers write addressing, register, read addressing, data
			let mut covered = Vec::with_capacity(buf.len() + 4);
			covered.push((self.addr << 1) as u8);
			covered.extend_from_slice(&addr_frame);
			covered.push((self.addr << 1) as u8 | 1);
			covered.extend_from_slice(&raw[..buf.len()]);
			let expected = pec_byte(&covered);
			let got = raw[buf.len()];
			if got != expected {
				return Err(crate::retimer::RetimerError::PecMismatch {
					reg,
					expected,
					got,
				}.into());
			}

			buf.copy_from_slice(&raw[..buf.len()]);
			Ok(())
		})
	}
}
