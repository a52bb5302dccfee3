//! `objcrate-dump` prints the super-block, free-list occupancy, and a forward walk of a crate
//! file. It never formats or mutates anything it opens; pass `--create` only if you mean to
//! initialize a fresh file.

use std::env;
use std::path::PathBuf;
use std::process::exit;

use objcrate::Crate;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,

	/// If true, format `path` as a fresh crate before dumping it.
	create: bool,

	/// The crate file to inspect.
	path: Option<PathBuf>,
}

impl Args {
	fn is_valid(&self) -> bool {
		self.help || self.path.is_some()
	}
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();

	let mut iter = env::args();
	args.prog = iter.next().unwrap_or_else(|| "objcrate-dump".to_owned());

	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"--create" => args.create = true,
			_ => args.path = Some(arg.into()),
		}
	}

	args
}

fn print_usage(prog: &str) {
	eprintln!("{prog}: bad usage");
	eprintln!("Try '{prog} --help' for more information.");
}

fn print_help(prog: &str) {
	println!();
	println!("Usage:");
	println!(" {prog} [options] <path>");
	println!();
	println!("Prints the super-block, free-list occupancy, and a forward walk of <path>.");
	println!();
	println!("Options:");
	println!(" -h, --help\tPrints help.");
	println!(" --create\tFormat <path> as a fresh crate before dumping it.");
}

fn main() {
	let args = parse_args();

	if !args.is_valid() {
		print_usage(&args.prog);
		exit(1);
	}
	if args.help {
		print_help(&args.prog);
		exit(0);
	}

	objcrate::set_logger(Some(|msg: &str| println!("{msg}")));

	let path = args.path.unwrap();
	let handle = match Crate::open(&path, args.create, false) {
		Ok(h) => h,
		Err(e) => {
			eprintln!("{}: cannot open {}: {}", args.prog, path.display(), e);
			exit(1);
		}
	};

	println!("capacity: {}", handle.capacity());
	match handle.get_index() {
		Ok(Some(_)) => println!("index: set"),
		Ok(None) => println!("index: (none)"),
		Err(e) => println!("index: error: {e}"),
	}
	println!();

	handle.debug_dump();
}
