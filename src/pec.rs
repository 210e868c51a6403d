//! SMBus Packet Error Checking and firmware image checksums.
//!
//! PEC is a CRC-8 over the polynomial x^8 + x^2 + x + 1 (0x107), computed
//! MSB-first with initial value 0, covering the slave address bytes and all
//! command/data bytes of a transaction.
//!
//! The firmware image validation uses plain running byte sums instead: the
//! retimer's Main Micro reports a mod 2^32 sum per 64 KiB EEPROM bank.

/// CRC-8 (poly 0x107) over `data`, as appended to SMBus transactions.
pub fn pec_byte(data: &[u8]) -> u8 {
	let mut crc = 0u8;
	for b in data {
		crc ^= b;
		for _ in 0..8 {
			if 0 != crc & 0x80 {
				crc = (crc << 1) ^ 0x07;
			} else {
				crc <<= 1;
			}
		}
	}
	crc
}

/// Running byte sum mod 256.
pub fn sum8(data: &[u8]) -> u8 {
	data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Running byte sum mod 2^32, matching the Main Micro bank checksum.
pub fn sum32(data: &[u8]) -> u32 {
	data.iter().fold(0u32, |sum, b| sum.wrapping_add(*b as u32))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn pec_known_vectors() {
		// CRC-8/SMBUS check value
		assert_eq!(pec_byte(b"123456789"), 0xf4);
		assert_eq!(pec_byte(&[]), 0x00);
		assert_eq!(pec_byte(&[0x00]), 0x00);
		assert_eq!(pec_byte(&[0x01]), 0x07);
	}

	#[test]
	fn pec_detects_single_bit_flip() {
		let msg = [0x5c, 0x06, 0xab, 0xcd];
		let good = pec_byte(&msg);
		let mut bad = msg;
		bad[2] ^= 0x10;
		assert_ne!(good, pec_byte(&bad));
	}

	#[test]
	fn running_sums() {
		assert_eq!(sum8(&[]), 0);
		assert_eq!(sum8(&[0xff, 0x01]), 0x00);
		assert_eq!(sum8(&[0x01, 0x02, 0x03]), 0x06);
		assert_eq!(sum32(&[0xff, 0x01]), 0x100);
		assert_eq!(sum32(&[0xff; 1024]), 1024 * 0xff);
	}
}
