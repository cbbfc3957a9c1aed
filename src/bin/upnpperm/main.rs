use miniupnpd_permissions::log::{LOG_DEBUG, LOG_INFO, LOG_NOTICE, LOG_USER, log_upto, openlog, setlogmask};
use miniupnpd_permissions::options::{DEFAULT_CONF_FILE, PermPolicy, global_perms, readoptionsfile};
use miniupnpd_permissions::upnppermissions::write_permlist;
use miniupnpd_permissions::{PermCheck, RuleSet, error, read_permission_line};
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

const EXIT_REJECTED: u8 = 1;
const EXIT_USAGE: u8 = 2;

fn print_usage() {
	eprintln!(
		"Usage:
    \tupnpperm [-f config_file] [-A \"permission rule\"]... [-S] [-d] [-v] COMMAND
    \nCommands:
    \tlist                          dump the permission rules
    \tcheck EPORT ADDR IPORT [DESC] check one port mapping request
    \tports ADDR IPORT              external ports ADDR:IPORT may map
    \tfree EPORT ADDR IPORT         nearest permitted external port to EPORT
    \nNotes:
    \tDefault config file is '{DEFAULT_CONF_FILE}', it is only read with -f.
    \t-A use following syntax for permission rules :
    \t  (allow|deny) (external port range) ip/mask (internal port range) [regex]
    \texamples :
    \t  \"allow 1024-65535 192.168.1.0/24 1024-65535\"
    \t  \"deny 0-65535 0.0.0.0/0 0-65535\"
    \t-S refuse the whole configuration file on the first invalid rule.
    \t-d also print log messages on stderr.
    \t-v enables LOG_INFO messages, -vv LOG_DEBUG as well.
    \t-h / --help prints this help and quits.
    "
	);
}

fn parse_arg<T: FromStr>(what: &str, s: &str) -> Option<T> {
	match T::from_str(s) {
		Ok(v) => Some(v),
		Err(_) => {
			eprintln!("invalid {what} \"{s}\"");
			None
		}
	}
}

fn main() -> ExitCode {
	let args = std::env::args().collect::<Vec<String>>();
	let mut optionsfile: Option<&str> = None;
	let mut extra_rules: Vec<&str> = vec![];
	let mut policy = PermPolicy::Lenient;
	let mut debug_flag = false;
	let mut verbosity_level = 0;

	let mut idx = 1;
	while idx < args.len() {
		let arg = args[idx].as_str();
		if !arg.starts_with('-') {
			break;
		}
		match arg {
			"-h" | "--help" => {
				print_usage();
				return ExitCode::SUCCESS;
			}
			"--version" => {
				println!("upnpperm version {}", env!("CARGO_PKG_VERSION"));
				return ExitCode::SUCCESS;
			}
			"-f" | "-A" => {
				let Some(value) = args.get(idx + 1) else {
					print_usage();
					return ExitCode::from(EXIT_USAGE);
				};
				if arg == "-f" {
					optionsfile = Some(value.as_str());
				} else {
					extra_rules.push(value.as_str());
				}
				idx += 1;
			}
			"-S" => policy = PermPolicy::Strict,
			"-d" => debug_flag = true,
			"-v" => verbosity_level = 1,
			"-vv" => verbosity_level = 2,
			_ => {
				eprintln!("unknown option {arg}");
				print_usage();
				return ExitCode::from(EXIT_USAGE);
			}
		}
		idx += 1;
	}

	let mut openlog_option = libc::LOG_PID;
	if debug_flag {
		openlog_option |= libc::LOG_PERROR;
	}
	openlog(c"upnpperm", openlog_option, LOG_USER);
	setlogmask(match verbosity_level {
		0 => log_upto(LOG_NOTICE),
		1 => log_upto(LOG_INFO),
		_ => log_upto(LOG_DEBUG),
	});

	let mut perms = match optionsfile {
		Some(fname) => match readoptionsfile(Path::new(fname), policy) {
			Ok(op) => op.upnpperms.into_vec(),
			Err(e) => {
				eprintln!("Error reading configuration file {fname}: {e}");
				error!("Error reading configuration file {}: {}", fname, e);
				return ExitCode::from(EXIT_USAGE);
			}
		},
		None => vec![],
	};
	for line in extra_rules {
		match read_permission_line(line) {
			Ok(p) => perms.push(p),
			Err(e) => {
				eprintln!("invalid permission rule \"{line}\": {e}");
				return ExitCode::from(EXIT_USAGE);
			}
		}
	}
	global_perms.replace(RuleSet::new(perms));
	let perms = global_perms.snapshot();

	let cmd = args[idx..].iter().map(String::as_str).collect::<Vec<_>>();
	let r = match cmd.as_slice() {
		["list"] => list(&perms),
		["check", eport, addr, iport] => check(&perms, eport, addr, iport, None),
		["check", eport, addr, iport, desc] => check(&perms, eport, addr, iport, Some(*desc)),
		["ports", addr, iport] => ports(&perms, addr, iport),
		["free", eport, addr, iport] => free(&perms, eport, addr, iport),
		_ => None,
	};
	match r {
		Some(code) => ExitCode::from(code),
		None => {
			print_usage();
			ExitCode::from(EXIT_USAGE)
		}
	}
}

fn list(perms: &RuleSet) -> Option<u8> {
	if let Err(e) = write_permlist(&mut io::stdout().lock(), perms) {
		eprintln!("cannot write permissions: {e}");
		return Some(EXIT_REJECTED);
	}
	Some(0)
}

fn check(perms: &RuleSet, eport: &str, addr: &str, iport: &str, desc: Option<&str>) -> Option<u8> {
	let eport: u16 = parse_arg("external port", eport)?;
	let addr: Ipv4Addr = parse_arg("address", addr)?;
	let iport: u16 = parse_arg("internal port", iport)?;

	let r = perms.evaluate(eport, addr, iport, desc);
	let verdict = if r.is_allowed() { "accepted" } else { "rejected" };
	match r {
		PermCheck::Matched { index, .. } => println!("{verdict} by rule {index:02} ({})", perms[index]),
		PermCheck::Default => println!("{verdict} by default"),
	}
	Some(if r.is_allowed() { 0 } else { EXIT_REJECTED })
}

fn ports(perms: &RuleSet, addr: &str, iport: &str) -> Option<u8> {
	let addr: Ipv4Addr = parse_arg("address", addr)?;
	let iport: u16 = parse_arg("internal port", iport)?;

	let allowed = perms.permitted_external_ports(addr, iport);
	for r in allowed.ranges() {
		if r.start() == r.end() {
			println!("{}", r.start());
		} else {
			println!("{}-{}", r.start(), r.end());
		}
	}
	println!("{} ports permitted", allowed.count_allowed());
	Some(0)
}

fn free(perms: &RuleSet, eport: &str, addr: &str, iport: &str) -> Option<u8> {
	let eport: u16 = parse_arg("external port", eport)?;
	let addr: Ipv4Addr = parse_arg("address", addr)?;
	let iport: u16 = parse_arg("internal port", iport)?;

	match perms.permitted_external_ports(addr, iport).pick_port(eport, |_| true) {
		Some(p) => {
			println!("{p}");
			Some(0)
		}
		None => {
			println!("NoPortMapsAvailable");
			Some(EXIT_REJECTED)
		}
	}
}
