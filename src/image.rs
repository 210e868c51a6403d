use std::fs;
use std::io::{
	BufRead,
	BufReader,
	Read,
};
use std::path::Path;

/// EEPROM capacity; also the full image size for raw binary files.
pub const MAX_IMAGE_SIZE: usize = 256 * 1024;

/// Marker the firmware build appends after the last meaningful byte.
/// Everything behind it is padding and doesn't need to be programmed.
pub const IMAGE_END_SENTINEL: [u8; 11] = [
	0xa5, 0x5a, 0xa5, 0x5a, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff,
];

/// A firmware image for the retimer EEPROM.
///
/// Immutable after loading; the write/verify pipeline only ever reads it.
pub struct FirmwareImage {
	data: Vec<u8>,
}

impl FirmwareImage {
	pub fn from_bytes(data: Vec<u8>) -> crate::AResult<Self> {
		ensure!(data.len() <= MAX_IMAGE_SIZE,
			"image too large: {} bytes (EEPROM holds {})", data.len(), MAX_IMAGE_SIZE
		);
		Ok(FirmwareImage { data })
	}

	/// Raw binary image; must be exactly the EEPROM capacity.
	pub fn load_raw<P: AsRef<Path>>(path: P) -> crate::AResult<Self> {
		let path = path.as_ref();
		with_context!(("couldn't load raw image {:?}", path), {
			let mut data = Vec::with_capacity(MAX_IMAGE_SIZE);
			fs::File::open(path)?.read_to_end(&mut data)?;
			ensure!(data.len() == MAX_IMAGE_SIZE,
				"raw image must be exactly {} bytes, got {}", MAX_IMAGE_SIZE, data.len()
			);
			Ok(FirmwareImage { data })
		})
	}

	/// Intel HEX image (`:LLAAAATT[data...]CC` records).
	pub fn load_ihex<P: AsRef<Path>>(path: P) -> crate::AResult<Self> {
		let path = path.as_ref();
		with_context!(("couldn't load Intel HEX image {:?}", path), {
			parse_ihex(BufReader::new(fs::File::open(path)?))
		})
	}

	pub fn load<P: AsRef<Path>>(path: P, ihex: bool) -> crate::AResult<Self> {
		if ihex {
			Self::load_ihex(path)
		} else {
			Self::load_raw(path)
		}
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	/// Offset one past the end sentinel, i.e. the amount of the image the
	/// writer actually has to program. If the sentinel is missing the whole
	/// EEPROM capacity is assumed.
	pub fn programmed_end(&self) -> usize {
		self.data
			.windows(IMAGE_END_SENTINEL.len())
			.position(|w| w == IMAGE_END_SENTINEL)
			.map(|at| at + IMAGE_END_SENTINEL.len())
			.unwrap_or(MAX_IMAGE_SIZE)
	}

	/// Per-byte differences against `target`, as (address, new value) pairs.
	///
	/// Refuses when more than a quarter of the image differs: the single-byte
	/// rewrite path is too slow per byte for that, use the bulk writer.
	pub fn diff(&self, target: &FirmwareImage) -> crate::AResult<Vec<DeltaEntry>> {
		ensure!(self.len() == target.len(),
			"can't diff images of different sizes ({} vs {})", self.len(), target.len()
		);

		let mut delta = Vec::new();
		for address in 0..self.len() {
			if self.data[address] != target.data[address] {
				delta.push(DeltaEntry {
					address,
					value: target.data[address],
				});
			}
		}

		let limit = self.len() / 4;
		if delta.len() > limit {
			return Err(crate::retimer::RetimerError::DeltaTooLarge {
				differing: delta.len(),
				total: self.len(),
				limit,
			}.into());
		}

		Ok(delta)
	}
}

/// One byte the delta writer has to reprogram.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeltaEntry {
	pub address: usize,
	pub value: u8,
}

fn hex_field(line: &str, from: usize, to: usize) -> crate::AResult<u32> {
	let field = line.get(from..to)
		.ok_or_else(|| format_err!("record too short ({} chars)", line.len()))?;
	Ok(u32::from_str_radix(field, 16)?)
}

/// Parse Intel HEX records into a full-capacity image, gaps filled with 0xff.
///
/// Handles data (00), end-of-file (01) and extended linear address (04)
/// records; the per-record checksum is validated before anything is applied.
pub fn parse_ihex<R: BufRead>(reader: R) -> crate::AResult<FirmwareImage> {
	let mut data = vec![0xffu8; MAX_IMAGE_SIZE];
	let mut upper: usize = 0; // bits 16..31 from the last type-04 record

	for (num, line) in reader.lines().enumerate() {
		let line = line?;
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let mut parse = || -> crate::AResult<bool> {
			ensure!(line.starts_with(':'), "record doesn't start with ':'");
			let len = hex_field(line, 1, 3)? as usize;
			ensure!(line.len() == 11 + 2 * len,
				"record length {} doesn't match byte count {}", line.len(), len
			);
			let offset = hex_field(line, 3, 7)? as usize;
			let rectype = hex_field(line, 7, 9)? as u8;

			let mut bytes = Vec::with_capacity(len + 5);
			for i in 0..len + 5 {
				bytes.push(hex_field(line, 1 + 2 * i, 3 + 2 * i)? as u8);
			}
			// sum over all record bytes including the trailing checksum is 0
			ensure!(crate::pec::sum8(&bytes) == 0,
				"record checksum mismatch (sum 0x{:02x})", crate::pec::sum8(&bytes)
			);
			let payload = &bytes[4..4 + len];

			match rectype {
				0x00 => {
					let address = upper | offset;
					ensure!(address + len <= MAX_IMAGE_SIZE,
						"data record beyond EEPROM capacity (address 0x{:06x}, {} bytes)", address, len
					);
					data[address..address + len].copy_from_slice(payload);
				},
				0x01 => return Ok(true),
				0x04 => {
					ensure!(len == 2, "extended linear address record with {} data bytes", len);
					upper = ((payload[0] as usize) << 24) | ((payload[1] as usize) << 16);
				},
				other => {
					// segment addressing and start records don't occur in
					// retimer images
					warn!("ignoring Intel HEX record type 0x{:02x}", other);
				},
			}

			Ok(false)
		};

		let done = with_context!(("Intel HEX line {}: {:?}", num + 1, line), parse())?;
		if done {
			return FirmwareImage::from_bytes(data);
		}
	}

	bail!("Intel HEX input without end-of-file record");
}

#[cfg(test)]
mod test {
	use super::*;

	fn image_with_sentinel_at(len: usize, at: usize) -> FirmwareImage {
		let mut data = vec![0u8; len];
		data[at..at + IMAGE_END_SENTINEL.len()].copy_from_slice(&IMAGE_END_SENTINEL);
		FirmwareImage::from_bytes(data).unwrap()
	}

	#[test]
	fn programmed_end_at_sentinel() {
		let image = image_with_sentinel_at(4096, 100);
		assert_eq!(image.programmed_end(), 111);

		let image = image_with_sentinel_at(MAX_IMAGE_SIZE, 0x2_0000);
		assert_eq!(image.programmed_end(), 0x2_0000 + 11);
	}

	#[test]
	fn programmed_end_without_sentinel() {
		let image = FirmwareImage::from_bytes(vec![0u8; 4096]).unwrap();
		assert_eq!(image.programmed_end(), MAX_IMAGE_SIZE);

		// a truncated sentinel doesn't count
		let mut data = vec![0u8; 4096];
		data[200..210].copy_from_slice(&IMAGE_END_SENTINEL[..10]);
		let image = FirmwareImage::from_bytes(data).unwrap();
		assert_eq!(image.programmed_end(), MAX_IMAGE_SIZE);
	}

	#[test]
	fn diff_within_limit() {
		let old = FirmwareImage::from_bytes(vec![0u8; 1024]).unwrap();
		let mut data = vec![0u8; 1024];
		data[3] = 0xaa;
		data[700] = 0x55;
		let new = FirmwareImage::from_bytes(data).unwrap();

		let delta = old.diff(&new).unwrap();
		assert_eq!(delta, vec![
			DeltaEntry { address: 3, value: 0xaa },
			DeltaEntry { address: 700, value: 0x55 },
		]);
	}

	#[test]
	fn diff_refuses_large_deltas() {
		let old = FirmwareImage::from_bytes(vec![0u8; 1024]).unwrap();
		// 25% + 1 differing bytes
		let mut data = vec![0u8; 1024];
		for b in data.iter_mut().take(257) {
			*b = 1;
		}
		let new = FirmwareImage::from_bytes(data).unwrap();
		assert!(old.diff(&new).is_err());

		// exactly 25% is still fine
		let mut data = vec![0u8; 1024];
		for b in data.iter_mut().take(256) {
			*b = 1;
		}
		let new = FirmwareImage::from_bytes(data).unwrap();
		assert_eq!(old.diff(&new).unwrap().len(), 256);
	}

	#[test]
	fn ihex_basic_records() {
		let src = "\
:0400000001020304F2
:02000004000breaks
";
		assert!(parse_ihex(src.as_bytes()).is_err());

		let src = "\
:0400000001020304F2
:020000040003F7
:04100000AABBCCDDDE
:00000001FF
";
		let image = parse_ihex(src.as_bytes()).unwrap();
		assert_eq!(&image.as_bytes()[0..4], &[0x01, 0x02, 0x03, 0x04]);
		assert_eq!(image.as_bytes()[4], 0xff);
		assert_eq!(&image.as_bytes()[0x3_1000..0x3_1004], &[0xaa, 0xbb, 0xcc, 0xdd]);
	}

	#[test]
	fn ihex_rejects_bad_checksum() {
		let src = ":0400000001020304F3\n:00000001FF\n";
		assert!(parse_ihex(src.as_bytes()).is_err());
	}

	#[test]
	fn ihex_requires_eof_record() {
		let src = ":0400000001020304F2\n";
		assert!(parse_ihex(src.as_bytes()).is_err());
	}
}
