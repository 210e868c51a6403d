mod linux;

pub use self::linux::{
	open_bus,
	LinuxI2c,
};

/// The transport every retimer operation is built from.
///
/// Registers are addressed with 16 bits; the wire frame is the big-endian
/// register address followed by the payload (plus an optional PEC trailer,
/// depending on the implementation).
///
/// `lock`/`unlock` bracket groups of transfers that must not be interleaved
/// with other traffic to the same device (a register read is a write of the
/// address followed by the actual read). The lock is advisory only, a plain
/// re-entrancy counter: sharing one bus handle between threads needs an
/// external mutex around the whole handle.
pub trait I2cBus {
	/// Human-readable device identity for log messages.
	fn describe(&self) -> String;

	fn write_block(&mut self, reg: u16, data: &[u8]) -> crate::AResult<()>;
	fn read_block(&mut self, reg: u16, buf: &mut [u8]) -> crate::AResult<()>;

	fn lock(&mut self);
	fn unlock(&mut self);

	fn write_byte(&mut self, reg: u16, data: u8) -> crate::AResult<()> {
		self.write_block(reg, &[data])
	}

	fn read_byte(&mut self, reg: u16) -> crate::AResult<u8> {
		let mut buf = [0u8; 1];
		self.read_block(reg, &mut buf)?;
		Ok(buf[0])
	}
}

impl<'a, B: ?Sized + I2cBus> I2cBus for &'a mut B {
	fn describe(&self) -> String {
		B::describe(*self)
	}

	fn write_block(&mut self, reg: u16, data: &[u8]) -> crate::AResult<()> {
		B::write_block(*self, reg, data)
	}

	fn read_block(&mut self, reg: u16, buf: &mut [u8]) -> crate::AResult<()> {
		B::read_block(*self, reg, buf)
	}

	fn lock(&mut self) {
		B::lock(*self)
	}

	fn unlock(&mut self) {
		B::unlock(*self)
	}
}
