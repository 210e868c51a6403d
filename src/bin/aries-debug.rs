#[macro_use]
extern crate clap;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

extern crate aries_retimer_flash;
use aries_retimer_flash::*;

use std::io::{
	self,
	Write,
};
use std::process::exit;

use aries_retimer_flash::i2c::LinuxI2c;
use aries_retimer_flash::image::FirmwareImage;
use aries_retimer_flash::retimer::{
	Retimer,
	Revision,
	Timing,
};

fn get_param<T>(matches: &clap::ArgMatches, name: &str) -> AResult<T>
where
	T: std::str::FromStr,
	failure::Error: From<<T as std::str::FromStr>::Err>,
{
	let param = match matches.value_of(name) {
		Some(p) => p,
		None => bail!("missing parameter {}", name),
	};
	param.parse::<T>().map_err(|e| {
		let e = failure::Error::from(e);
		let msg = format!("invalid parameter {}: {}", name, e);
		e.context(msg).into()
	})
}

fn open_retimer(sub_m: &clap::ArgMatches) -> AResult<Retimer<LinuxI2c>> {
	let bus_path: String = get_param(sub_m, "BUS")?;
	let addr_s: String = get_param(sub_m, "ADDR")?;
	let addr = u16::from_str_radix(addr_s.trim_start_matches("0x"), 16)
		.map_err(|e| format_err!("invalid I2C address {:?}: {}", addr_s, e))?;
	let revision: Revision = match sub_m.value_of("revision") {
		Some(r) => r.parse()?,
		None => Revision::A0,
	};

	let bus = i2c::open_bus(&bus_path, addr, sub_m.is_present("pec"))?;
	Ok(Retimer::open(bus, revision, Timing::hardware())?)
}

fn info(sub_m: &clap::ArgMatches) -> AResult<()> {
	let rt = open_retimer(sub_m)?;
	println!("device:     {}", rt.describe());
	println!("revision:   {:?}", rt.revision());
	println!("firmware:   {}", rt.fw_version());
	println!("main micro: {}", if rt.is_legacy() { "dead (legacy mode)" } else { "alive" });
	let g = rt.geometry();
	println!("geometry:   {} banks of {} bytes, burst {}, block {}",
		image::MAX_IMAGE_SIZE / g.bank_size, g.bank_size, g.max_burst, g.block_size);
	Ok(())
}

fn dump(sub_m: &clap::ArgMatches) -> AResult<()> {
	let len: usize = match sub_m.value_of("length") {
		Some(_) => get_param(sub_m, "length")?,
		None => image::MAX_IMAGE_SIZE,
	};
	let mut rt = open_retimer(sub_m)?;
	let data = eeprom::read_image(&mut rt, len)?;
	io::stdout().write_all(&data)?;
	Ok(())
}

fn checksum(sub_m: &clap::ArgMatches) -> AResult<()> {
	let mut rt = open_retimer(sub_m)?;
	ensure!(!rt.is_legacy(), "bank checksums need a live Main Micro");
	let banks = image::MAX_IMAGE_SIZE / rt.geometry().bank_size;
	for bank in 0..banks {
		let sum = rt.bank_checksum(bank as u8)?;
		println!("bank {}: 0x{:08x}", bank, sum);
	}
	Ok(())
}

fn image_end(sub_m: &clap::ArgMatches) -> AResult<()> {
	let path: String = get_param(sub_m, "IMAGE")?;
	let image = FirmwareImage::load(&path, sub_m.is_present("ihex"))?;
	let end = image.programmed_end();
	if end == image::MAX_IMAGE_SIZE {
		println!("no end sentinel, full capacity: 0x{:x}", end);
	} else {
		println!("end sentinel found, programmed region: 0x{:x}", end);
	}
	Ok(())
}

fn main_app() -> AResult<()> {
	let matches = clap_app!(@app (app_from_crate!())
		(@setting SubcommandRequiredElseHelp)
		(global_setting: clap::AppSettings::VersionlessSubcommands)
		(@subcommand info =>
			(about: "show firmware version, heartbeat state and transfer geometry")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
		)
		(@subcommand dump =>
			(about: "dump EEPROM contents as binary to stdout")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg length: --length +takes_value "bytes to dump (default: full capacity)")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
		)
		(@subcommand checksum =>
			(about: "print the Main Micro checksum of every EEPROM bank")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
		)
		(@subcommand image_end =>
			(about: "scan a local image file for the end sentinel")
			(@arg ihex: --ihex "image file is Intel HEX instead of raw binary")
			(@arg IMAGE: +required "firmware image file")
		)
	).get_matches();

	match matches.subcommand() {
		("info", Some(sub_m)) => info(sub_m),
		("dump", Some(sub_m)) => dump(sub_m),
		("checksum", Some(sub_m)) => checksum(sub_m),
		("image_end", Some(sub_m)) => image_end(sub_m),
		("", _) => bail!("no subcommand"),
		(cmd, _) => bail!("not implemented subcommand {:?}", cmd),
	}
}

fn main() {
	env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

	if let Err(e) = main_app() {
		error!("Error: {}", e);
		exit(1);
	}
}
