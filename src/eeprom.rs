//! EEPROM firmware image pipeline: bulk write, verify (byte compare or
//! bank checksum), delta rewrite and the combined update policy.
//!
//! Every primitive error aborts the running operation and propagates; there
//! is no partial-write rollback. The only built-in recovery is the single
//! rewrite-and-reverify of an individual mismatching byte during verify.

use crate::i2c::I2cBus;
use crate::image::FirmwareImage;
use crate::retimer::{
	Progress,
	Retimer,
	RetimerError,
};

fn round_up(value: usize, to: usize) -> usize {
	(value + to - 1) / to * to
}

/// End of the region that actually needs programming: the image's sentinel
/// position, clamped to the buffer, rounded up to the block size.
fn program_end<B: I2cBus>(rt: &Retimer<B>, image: &FirmwareImage) -> usize {
	let end = image.programmed_end().min(image.len());
	round_up(end, rt.geometry().block_size).min(image.len())
}

/// Program `image` into the EEPROM, up to the end sentinel.
pub fn write_image<B: I2cBus>(rt: &mut Retimer<B>, image: &FirmwareImage) -> crate::AResult<()> {
	ensure!(!image.is_empty(), "refusing to write an empty image");
	rt.advance(Progress::WriteStart);

	rt.enter_programming()?;
	rt.soft_reset_master()?;

	let end = program_end(rt, image);
	let burst = rt.geometry().max_burst;
	info!("{}: writing 0x{:x} of 0x{:x} image bytes ({})",
		rt.describe(), end, image.len(),
		if rt.is_legacy() { "legacy" } else { "assisted" });

	let mut written = 0usize;
	let mut start = 0usize;
	while start < end {
		let chunk = &image.as_bytes()[start..end.min(start + burst)];
		rt.write_region(start, chunk)?;
		// EEPROM write cycle between bursts
		rt.sleep(rt.timing().write_cycle);

		written += chunk.len();
		rt.set_percent((written * 100 / end) as u8);
		start += chunk.len();
	}

	rt.leave_programming()?;
	rt.advance(Progress::WriteDone);
	Ok(())
}

/// Read the programmed region back and compare byte for byte. A mismatch
/// gets exactly one rewrite-and-reread; scanning continues either way and
/// the mismatch count decides the overall result.
pub fn verify_image<B: I2cBus>(rt: &mut Retimer<B>, image: &FirmwareImage) -> crate::AResult<()> {
	rt.advance(Progress::VerifyStart);

	let end = program_end(rt, image);
	let burst = rt.geometry().max_burst;
	info!("{}: verifying 0x{:x} bytes", rt.describe(), end);

	let mut mismatches = 0usize;
	let mut buf = vec![0u8; burst];
	let mut start = 0usize;
	while start < end {
		let len = burst.min(end - start);
		rt.read_region(start, &mut buf[..len])?;

		for i in 0..len {
			let address = start + i;
			let expected = image.as_bytes()[address];
			if buf[i] == expected {
				continue;
			}
			warn!("{}: mismatch at 0x{:06x}: expected 0x{:02x}, read 0x{:02x}, rewriting",
				rt.describe(), address, expected, buf[i]);
			rt.rewrite_byte(address, expected)?;
			let reread = rt.read_byte_at(address)?;
			if reread != expected {
				error!("{}: 0x{:06x} still reads 0x{:02x} after rewrite",
					rt.describe(), address, reread);
				mismatches += 1;
			}
		}

		start += len;
	}

	if mismatches > 0 {
		return Err(RetimerError::VerifyFailure { mismatches }.into());
	}
	rt.advance(Progress::VerifyDone);
	Ok(())
}

/// Compare per-bank Main Micro checksums against locally computed sums.
/// Fast, but only tells which bank differs, not which byte.
pub fn verify_checksum<B: I2cBus>(rt: &mut Retimer<B>, image: &FirmwareImage) -> crate::AResult<()> {
	ensure!(!rt.is_legacy(), "bank checksums need a live Main Micro");
	rt.advance(Progress::VerifyStart);

	let bank_size = rt.geometry().bank_size;
	let banks = (image.len() + bank_size - 1) / bank_size;
	for bank in 0..banks {
		let from = bank * bank_size;
		let to = image.len().min(from + bank_size);
		let mut local = crate::pec::sum32(&image.as_bytes()[from..to]);
		// the device sums the whole bank; short images leave erased 0xff
		// cells behind the buffer end
		local = local.wrapping_add(0xff * ((bank_size - (to - from)) as u32));

		let device = rt.bank_checksum(bank as u8)?;
		if device != local {
			return Err(RetimerError::ChecksumMismatch {
				bank: bank as u8,
				device,
				local,
			}.into());
		}
		debug!("{}: bank {} checksum 0x{:08x} ok", rt.describe(), bank, device);
	}

	rt.advance(Progress::VerifyDone);
	Ok(())
}

/// Rewrite only the bytes where `target` differs from `current` (what the
/// EEPROM holds now). Refuses via [`FirmwareImage::diff`] when more than a
/// quarter differs.
pub fn write_delta<B: I2cBus>(
	rt: &mut Retimer<B>,
	current: &FirmwareImage,
	target: &FirmwareImage,
) -> crate::AResult<()> {
	let delta = current.diff(target)?;
	info!("{}: delta update, {} byte(s) to rewrite", rt.describe(), delta.len());
	if delta.is_empty() {
		return Ok(());
	}

	rt.enter_programming()?;
	rt.soft_reset_master()?;

	for entry in &delta {
		rt.rewrite_byte(entry.address, entry.value)?;
		let mut reread = rt.read_byte_at(entry.address)?;
		if reread != entry.value {
			warn!("{}: delta byte 0x{:06x} read back 0x{:02x}, retrying once",
				rt.describe(), entry.address, reread);
			rt.rewrite_byte(entry.address, entry.value)?;
			reread = rt.read_byte_at(entry.address)?;
			if reread != entry.value {
				return Err(RetimerError::VerifyFailure { mismatches: 1 }.into());
			}
		}
	}

	rt.leave_programming()?;
	Ok(())
}

/// Read `len` bytes of EEPROM contents back (debug dumps, round-trips).
pub fn read_image<B: I2cBus>(rt: &mut Retimer<B>, len: usize) -> crate::AResult<Vec<u8>> {
	ensure!(len <= crate::image::MAX_IMAGE_SIZE,
		"read length 0x{:x} beyond EEPROM capacity", len
	);
	let burst = rt.geometry().max_burst;
	let mut data = vec![0u8; len];
	let mut start = 0usize;
	while start < len {
		let chunk = burst.min(len - start);
		rt.read_region(start, &mut data[start..start + chunk])?;
		start += chunk;
	}
	Ok(data)
}

/// The full update policy: write, then the cheap checksum verify, falling
/// back to the byte-level verify (which can repair single bytes) when the
/// checksums disagree. Legacy mode has no checksum engine and goes straight
/// to the byte verify.
pub fn update_firmware<B: I2cBus>(rt: &mut Retimer<B>, image: &FirmwareImage) -> crate::AResult<()> {
	rt.begin_operation();
	write_image(rt, image)?;

	if rt.is_legacy() {
		verify_image(rt, image)?;
	} else if let Err(e) = verify_checksum(rt, image) {
		warn!("{}: checksum verify failed ({}), falling back to byte verify", rt.describe(), e);
		verify_image(rt, image)?;
	}

	rt.advance(Progress::Complete);
	info!("{}: firmware update complete", rt.describe());
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::emu::EmuRetimer;
	use crate::image::{FirmwareImage, IMAGE_END_SENTINEL, MAX_IMAGE_SIZE};
	use crate::retimer::{Revision, Timing};

	fn open(fw: (u8, u8, u16), alive: bool) -> Retimer<EmuRetimer> {
		let emu = EmuRetimer::new(Revision::A0, fw, alive);
		Retimer::open(emu, Revision::A0, Timing::none()).unwrap()
	}

	// pattern up to the sentinel, 0xff padding behind it (like real builds)
	fn patterned_image(len: usize, sentinel_at: Option<usize>) -> FirmwareImage {
		let mut data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
		if let Some(at) = sentinel_at {
			data[at..at + IMAGE_END_SENTINEL.len()].copy_from_slice(&IMAGE_END_SENTINEL);
			for b in data[at + IMAGE_END_SENTINEL.len()..].iter_mut() {
				*b = 0xff;
			}
		}
		FirmwareImage::from_bytes(data).unwrap()
	}

	#[test]
	fn write_stops_at_rounded_sentinel() {
		// sentinel at 100 ends the image at 111; with 32-byte blocks the
		// writer programs [0, 128) and leaves the rest erased
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(4096, Some(100));
		write_image(&mut rt, &image).unwrap();

		let emu = rt.into_bus();
		assert_eq!(&emu.eeprom[..128], &image.as_bytes()[..128]);
		assert!(emu.eeprom[128..4096].iter().all(|b| *b == 0xff));
		assert_eq!(emu.eeprom_writes, 128);
	}

	#[test]
	fn roundtrip_assisted() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(2048, None);
		write_image(&mut rt, &image).unwrap();
		let back = read_image(&mut rt, 2048).unwrap();
		assert_eq!(back, image.as_bytes());
		verify_image(&mut rt, &image).unwrap();
	}

	#[test]
	fn roundtrip_legacy() {
		let mut rt = open((1, 0, 0), false);
		assert!(rt.is_legacy());
		let image = patterned_image(512, None);
		write_image(&mut rt, &image).unwrap();
		let back = read_image(&mut rt, 512).unwrap();
		assert_eq!(back, image.as_bytes());
		verify_image(&mut rt, &image).unwrap();
	}

	#[test]
	fn verify_repairs_single_corruption() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(1024, None);
		write_image(&mut rt, &image).unwrap();

		rt.bus_mut().eeprom[700] ^= 0xff;
		verify_image(&mut rt, &image).unwrap();
		assert_eq!(rt.bus_mut().eeprom[700], image.as_bytes()[700]);
	}

	#[test]
	fn verify_reports_persistent_corruption() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(1024, None);
		write_image(&mut rt, &image).unwrap();

		// reads at these cells never return what was written
		let bad0 = image.as_bytes()[100] ^ 0x01;
		let bad1 = image.as_bytes()[900] ^ 0x80;
		rt.bus_mut().stuck_reads.push((100, bad0));
		rt.bus_mut().stuck_reads.push((900, bad1));

		let err = verify_image(&mut rt, &image).unwrap_err();
		let err = err.downcast::<RetimerError>().unwrap();
		match err {
			RetimerError::VerifyFailure { mismatches } => assert_eq!(mismatches, 2),
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn checksum_verify_agrees_after_write() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(MAX_IMAGE_SIZE, Some(MAX_IMAGE_SIZE - 64));
		write_image(&mut rt, &image).unwrap();
		verify_checksum(&mut rt, &image).unwrap();
	}

	#[test]
	fn checksum_verify_spots_corrupt_bank() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(MAX_IMAGE_SIZE, Some(MAX_IMAGE_SIZE - 64));
		write_image(&mut rt, &image).unwrap();

		rt.bus_mut().eeprom[0x2_1234] ^= 0x40;
		let err = verify_checksum(&mut rt, &image).unwrap_err();
		match err.downcast::<RetimerError>().unwrap() {
			RetimerError::ChecksumMismatch { bank, .. } => assert_eq!(bank, 2),
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn delta_rewrites_only_differences() {
		let mut rt = open((1, 1, 0), true);
		let current = patterned_image(1024, None);
		write_image(&mut rt, &current).unwrap();
		let writes_before = rt.bus_mut().eeprom_writes;

		let mut data = current.as_bytes().to_vec();
		data[10] = 0xde;
		data[500] = 0xad;
		data[1023] = 0xbe;
		let target = FirmwareImage::from_bytes(data).unwrap();

		write_delta(&mut rt, &current, &target).unwrap();
		assert_eq!(rt.bus_mut().eeprom_writes, writes_before + 3);
		assert_eq!(rt.bus_mut().eeprom[10], 0xde);
		assert_eq!(rt.bus_mut().eeprom[500], 0xad);
		assert_eq!(rt.bus_mut().eeprom[1023], 0xbe);
		assert_eq!(rt.bus_mut().eeprom[11], current.as_bytes()[11]);
	}

	#[test]
	fn delta_refuses_large_diff_without_writing() {
		let mut rt = open((1, 1, 0), true);
		let current = FirmwareImage::from_bytes(vec![0u8; 1024]).unwrap();
		let target = FirmwareImage::from_bytes(vec![1u8; 1024]).unwrap();

		assert!(write_delta(&mut rt, &current, &target).is_err());
		assert_eq!(rt.bus_mut().eeprom_writes, 0);
	}

	#[test]
	fn update_firmware_full_policy() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(MAX_IMAGE_SIZE, Some(0x1_0000));
		update_firmware(&mut rt, &image).unwrap();
		assert_eq!(rt.progress(), Progress::Complete);
		assert_eq!(rt.percent(), 100);
	}

	#[test]
	fn update_firmware_legacy_policy() {
		let mut rt = open((1, 0, 0), false);
		let image = patterned_image(2048, Some(1000));
		update_firmware(&mut rt, &image).unwrap();
		assert_eq!(rt.progress(), Progress::Complete);
	}

	#[test]
	fn update_falls_back_to_byte_verify() {
		let mut rt = open((1, 1, 0), true);
		let image = patterned_image(4096, Some(3000));
		// a stuck cell makes the bank checksum disagree; the byte verify
		// fallback then counts (and fails on) the same cell
		rt.bus_mut().stuck_reads.push((40, 0x13));
		assert!(update_firmware(&mut rt, &image).is_err());
	}
}
