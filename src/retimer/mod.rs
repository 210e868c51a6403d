use std::fmt;
use std::thread;
use std::time::Duration;

use crate::i2c::I2cBus;

mod micro;
pub(crate) mod regs;

pub use self::regs::{
	RegMap,
	Revision,
};

/// Everything the device can fail with. Transport-level IO errors are
/// wrapped separately; these are the protocol-level outcomes.
#[derive(Debug, Fail)]
pub enum RetimerError {
	#[fail(display = "invalid argument: {}", _0)]
	InvalidArgument(String),
	#[fail(display = "Main Micro busy: status register 0x{:04x} never cleared", reg)]
	MicroBusy { reg: u16 },
	#[fail(display = "checksum for bank {} not ready in time", bank)]
	ChecksumTimeout { bank: u8 },
	#[fail(display = "EEPROM verify failed: {} byte(s) still mismatch after rewrite", mismatches)]
	VerifyFailure { mismatches: usize },
	#[fail(display = "EEPROM checksum mismatch in bank {}: device 0x{:08x}, image 0x{:08x}", bank, device, local)]
	ChecksumMismatch { bank: u8, device: u32, local: u32 },
	#[fail(display = "{} of {} bytes differ (limit {}), use the bulk writer instead", differing, total, limit)]
	DeltaTooLarge { differing: usize, total: usize, limit: usize },
	#[fail(display = "PEC mismatch reading reg 0x{:04x}: expected 0x{:02x}, got 0x{:02x}", reg, expected, got)]
	PecMismatch { reg: u16, expected: u8, got: u8 },
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FwVersion {
	pub major: u8,
	pub minor: u8,
	pub build: u16,
}

impl FwVersion {
	pub fn at_least(&self, major: u8, minor: u8) -> bool {
		(self.major, self.minor) >= (major, minor)
	}
}

impl fmt::Display for FwVersion {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.build)
	}
}

/// EEPROM transfer geometry, fixed once the firmware version is known.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Geometry {
	/// 64 KiB window selected via the page register
	pub bank_size: usize,
	/// largest burst the Main Micro accepts per address setup
	pub max_burst: usize,
	/// bytes staged per block command (holding window use)
	pub block_size: usize,
	/// whether block commands need `IM_CMD_MODIFIER`
	pub cmd_modifier: bool,
}

impl Geometry {
	pub fn for_version(fw: FwVersion) -> Geometry {
		// 32-byte block transfers (and the command modifier that goes with
		// them) arrived with firmware 1.1; everything older stages 4 bytes
		let (block_size, cmd_modifier) = if fw.at_least(1, 1) {
			(regs::IM_DATA_WINDOW, true)
		} else {
			(4, false)
		};
		Geometry {
			bank_size: 64 * 1024,
			max_burst: 256,
			block_size,
			cmd_modifier,
		}
	}
}

/// Delays dictated by the hardware. Injected so tests (and impatient
/// callers with fast parts) can tune them; `none()` removes all sleeping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Timing {
	/// between status register polls
	pub poll_interval: Duration,
	/// EEPROM write cycle, after each programming burst
	pub write_cycle: Duration,
	/// after toggling reset lines
	pub reset_settle: Duration,
	/// per edge while bit-banging the master state machine
	pub bit_delay: Duration,
}

impl Timing {
	pub fn hardware() -> Timing {
		Timing {
			poll_interval: Duration::from_millis(5),
			write_cycle: Duration::from_millis(5),
			reset_settle: Duration::from_millis(100),
			bit_delay: Duration::from_micros(50),
		}
	}

	pub fn none() -> Timing {
		Timing {
			poll_interval: Duration::from_secs(0),
			write_cycle: Duration::from_secs(0),
			reset_settle: Duration::from_secs(0),
			bit_delay: Duration::from_secs(0),
		}
	}
}

/// Milestones of a firmware update, in order. Advanced monotonically on the
/// handle so an external observer can poll where a long update stands.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Progress {
	Idle,
	WriteStart,
	WriteDone,
	VerifyStart,
	VerifyDone,
	Complete,
}

/// An opened retimer: transport plus everything derived at init time.
///
/// Exclusively owned by the calling thread for the duration of any
/// operation; there is no internal synchronization.
pub struct Retimer<B: I2cBus> {
	pub(crate) bus: B,
	revision: Revision,
	fw: FwVersion,
	geometry: Geometry,
	legacy: bool,
	timing: Timing,
	progress: Progress,
	percent: u8,
	/// last value written to the page register; None when unknown
	pub(crate) current_page: Option<u8>,
}

const HEARTBEAT_PROBES: usize = 10;

impl<B: I2cBus> Retimer<B> {
	/// Read the firmware version, probe the Main Micro heartbeat and derive
	/// the transfer geometry. A dead heartbeat forces legacy programming.
	pub fn open(mut bus: B, revision: Revision, timing: Timing) -> crate::AResult<Retimer<B>> {
		let regmap = revision.regs();

		let mut raw = [0u8; 4];
		bus.read_block(regmap.fw_version, &mut raw)?;
		let fw = FwVersion {
			major: raw[0],
			minor: raw[1],
			build: ((raw[2] as u16) << 8) | raw[3] as u16,
		};

		let first = bus.read_byte(regmap.mm_heartbeat)?;
		let mut alive = false;
		for _ in 0..HEARTBEAT_PROBES {
			thread::sleep(timing.poll_interval);
			if bus.read_byte(regmap.mm_heartbeat)? != first {
				alive = true;
				break;
			}
		}

		let geometry = Geometry::for_version(fw);
		if alive {
			info!("{}: firmware {} ({:?}), block size {}",
				bus.describe(), fw, revision, geometry.block_size);
		} else {
			warn!("{}: firmware {} ({:?}), Main Micro heartbeat dead, falling back to legacy programming",
				bus.describe(), fw, revision);
		}

		Ok(Retimer {
			bus,
			revision,
			fw,
			geometry,
			legacy: !alive,
			timing,
			progress: Progress::Idle,
			percent: 0,
			current_page: None,
		})
	}

	pub fn fw_version(&self) -> FwVersion {
		self.fw
	}

	pub fn revision(&self) -> Revision {
		self.revision
	}

	pub fn geometry(&self) -> Geometry {
		self.geometry
	}

	pub fn is_legacy(&self) -> bool {
		self.legacy
	}

	/// Force the slow byte-at-a-time path even with a live Main Micro
	/// (needed e.g. when the device was discovered via address resolution).
	pub fn force_legacy(&mut self) {
		self.legacy = true;
	}

	pub fn timing(&self) -> Timing {
		self.timing
	}

	pub fn progress(&self) -> Progress {
		self.progress
	}

	pub fn percent(&self) -> u8 {
		self.percent
	}

	pub fn describe(&self) -> String {
		self.bus.describe()
	}

	pub fn bus_mut(&mut self) -> &mut B {
		&mut self.bus
	}

	pub fn into_bus(self) -> B {
		self.bus
	}

	pub(crate) fn sleep(&self, d: Duration) {
		if d > Duration::from_secs(0) {
			thread::sleep(d);
		}
	}

	/// Progress only ever moves forward within an operation.
	pub(crate) fn advance(&mut self, p: Progress) {
		if p > self.progress {
			debug!("{}: {:?}", self.bus.describe(), p);
			self.progress = p;
		}
	}

	pub(crate) fn set_percent(&mut self, percent: u8) {
		self.percent = percent;
	}

	/// Reset the milestone tracking for a fresh update.
	pub(crate) fn begin_operation(&mut self) {
		self.progress = Progress::Idle;
		self.percent = 0;
	}
}
