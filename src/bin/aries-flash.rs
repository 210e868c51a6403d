#[macro_use]
extern crate clap;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

extern crate aries_retimer_flash;
use aries_retimer_flash::*;

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

fn get_addr(matches: &clap::ArgMatches) -> AResult<u16> {
	let param = match matches.value_of("ADDR") {
		Some(p) => p,
		None => bail!("missing parameter ADDR"),
	};
	let trimmed = param.trim_start_matches("0x");
	u16::from_str_radix(trimmed, 16)
		.map_err(|e| format_err!("invalid I2C address {:?}: {}", param, e))
}

fn open_retimer(sub_m: &clap::ArgMatches) -> AResult<Retimer<LinuxI2c>> {
	let bus_path: String = get_param(sub_m, "BUS")?;
	let addr = get_addr(sub_m)?;
	let revision: Revision = match sub_m.value_of("revision") {
		Some(r) => r.parse()?,
		None => Revision::A0,
	};
	let pec = sub_m.is_present("pec");

	let bus = i2c::open_bus(&bus_path, addr, pec)?;
	let mut rt = Retimer::open(bus, revision, Timing::hardware())?;
	if sub_m.is_present("legacy") {
		rt.force_legacy();
	}
	Ok(rt)
}

fn load_image(sub_m: &clap::ArgMatches, name: &str) -> AResult<FirmwareImage> {
	let path: String = get_param(sub_m, name)?;
	FirmwareImage::load(&path, sub_m.is_present("ihex"))
}

fn update(sub_m: &clap::ArgMatches) -> AResult<()> {
	let image = load_image(sub_m, "IMAGE")?;
	let mut rt = open_retimer(sub_m)?;
	eeprom::update_firmware(&mut rt, &image)
}

fn write(sub_m: &clap::ArgMatches) -> AResult<()> {
	let image = load_image(sub_m, "IMAGE")?;
	let mut rt = open_retimer(sub_m)?;
	eeprom::write_image(&mut rt, &image)
}

fn verify(sub_m: &clap::ArgMatches) -> AResult<()> {
	let image = load_image(sub_m, "IMAGE")?;
	let mut rt = open_retimer(sub_m)?;
	eeprom::verify_image(&mut rt, &image)
}

fn check(sub_m: &clap::ArgMatches) -> AResult<()> {
	let image = load_image(sub_m, "IMAGE")?;
	let mut rt = open_retimer(sub_m)?;
	eeprom::verify_checksum(&mut rt, &image)
}

fn delta(sub_m: &clap::ArgMatches) -> AResult<()> {
	let path: String = get_param(sub_m, "CURRENT")?;
	let current = FirmwareImage::load(&path, sub_m.is_present("ihex"))?;
	let path: String = get_param(sub_m, "TARGET")?;
	let target = FirmwareImage::load(&path, sub_m.is_present("ihex"))?;
	let mut rt = open_retimer(sub_m)?;
	eeprom::write_delta(&mut rt, &current, &target)
}

fn main_app() -> AResult<()> {
	let matches = clap_app!(@app (app_from_crate!())
		(@setting SubcommandRequiredElseHelp)
		(global_setting: clap::AppSettings::VersionlessSubcommands)
		(@subcommand update =>
			(about: "write image and verify (checksum first, byte verify fallback)")
			(@arg ihex: --ihex "image file is Intel HEX instead of raw binary")
			(@arg legacy: --legacy "force slow byte-at-a-time programming")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
			(@arg IMAGE: +required "firmware image file")
		)
		(@subcommand write =>
			(about: "write image without verifying")
			(@arg ihex: --ihex "image file is Intel HEX instead of raw binary")
			(@arg legacy: --legacy "force slow byte-at-a-time programming")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
			(@arg IMAGE: +required "firmware image file")
		)
		(@subcommand verify =>
			(about: "byte-compare EEPROM contents against image, repairing single bytes")
			(@arg ihex: --ihex "image file is Intel HEX instead of raw binary")
			(@arg legacy: --legacy "force slow byte-at-a-time access")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
			(@arg IMAGE: +required "firmware image file")
		)
		(@subcommand check =>
			(about: "compare per-bank checksums against image (fast, needs live Main Micro)")
			(@arg ihex: --ihex "image file is Intel HEX instead of raw binary")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
			(@arg IMAGE: +required "firmware image file")
		)
		(@subcommand delta =>
			(about: "rewrite only the bytes differing between two images (<= 25%)")
			(@arg ihex: --ihex "image files are Intel HEX instead of raw binary")
			(@arg legacy: --legacy "force slow byte-at-a-time programming")
			(@arg pec: --pec "enable SMBus packet error checking")
			(@arg revision: --revision +takes_value "silicon revision: a0 (default) or mpw")
			(@arg BUS: +required "I2C bus device (/dev/i2c-N)")
			(@arg ADDR: +required "retimer slave address (hex)")
			(@arg CURRENT: +required "image currently in the EEPROM")
			(@arg TARGET: +required "image to update to")
		)
	).get_matches();

	match matches.subcommand() {
		("update", Some(sub_m)) => update(sub_m),
		("write", Some(sub_m)) => write(sub_m),
		("verify", Some(sub_m)) => verify(sub_m),
		("check", Some(sub_m)) => check(sub_m),
		("delta", Some(sub_m)) => delta(sub_m),
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
