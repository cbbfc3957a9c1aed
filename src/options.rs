use crate::permparse::ParseError;
pub use crate::upnppermissions::{PermissionRule, RuleSet, read_permission_line};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const DEFAULT_CONF_FILE: &str = "/etc/miniupnpd/miniupnpd.conf";

/// What to do with a permission line that does not parse.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PermPolicy {
	/// log it and keep the other rules
	#[default]
	Lenient,
	/// refuse the whole file
	Strict,
}

#[derive(Debug, Error)]
pub enum LoadError {
	#[error("cannot read configuration: {0}")]
	Io(#[from] io::Error),
	#[error("invalid permission rule at line {line}: {source}")]
	Rule {
		line: usize,
		#[source]
		source: ParseError,
	},
}

#[derive(Debug, Default)]
pub struct Options {
	pub upnpperms: RuleSet,
	/// permission lines dropped under [`PermPolicy::Lenient`]
	pub skipped: usize,
}

pub fn read_options<R: BufRead>(reader: R, policy: PermPolicy) -> Result<Options, LoadError> {
	let mut perms = vec![];
	let mut option = Options::default();

	for (i, line) in reader.lines().enumerate() {
		let line = line?;
		// CRLF files, a pattern keeps its trailing whitespace
		let line_ = line.strip_suffix('\r').unwrap_or(&line).trim_start();
		if line_.is_empty() || line_.starts_with('#') {
			continue;
		}
		if line_.starts_with("allow") | line_.starts_with("deny") {
			match read_permission_line(line_) {
				Ok(perm) => perms.push(perm),
				Err(source) if policy == PermPolicy::Strict => return Err(LoadError::Rule { line: i + 1, source }),
				Err(e) => {
					warn!("ignoring permission rule at line {}: {}", i + 1, e);
					option.skipped += 1;
				}
			}
			continue;
		}
		if let Some((key, _)) = line_.split_once('=') {
			// daemon option, not ours
			let _ = key;
			trace!("skipping option {}", key.trim());
			continue;
		}
		error!("cannot parse option {}", line_);
	}
	option.upnpperms = RuleSet::new(perms);

	Ok(option)
}

pub fn readoptionsfile(fname: &Path, policy: PermPolicy) -> Result<Options, LoadError> {
	trace!("Reading configuration from file {:?}", fname);
	let file = File::open(fname)?;

	let reader = BufReader::with_capacity(1024, file);
	read_options(reader, policy)
}

/// The rule list in use, replaced as a whole on reload.
///
/// Readers take a snapshot and keep using it even if a reload happens
/// meanwhile, a list is never seen half built.
#[derive(Debug, Default)]
pub struct PermStore {
	current: RwLock<Arc<RuleSet>>,
}

impl PermStore {
	pub fn new(perms: RuleSet) -> Self {
		Self { current: RwLock::new(Arc::new(perms)) }
	}

	pub fn snapshot(&self) -> Arc<RuleSet> {
		self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Install `perms`, returning the previous generation.
	pub fn replace(&self, perms: RuleSet) -> Arc<RuleSet> {
		let new = Arc::new(perms);
		let mut cur = self.current.write().unwrap_or_else(PoisonError::into_inner);
		std::mem::replace(&mut *cur, new)
	}

	/// Parse `fname` completely, then swap it in. On error the current
	/// rules stay.
	pub fn reload_from_file(&self, fname: &Path, policy: PermPolicy) -> Result<usize, LoadError> {
		let option = match readoptionsfile(fname, policy) {
			Ok(o) => o,
			Err(e) => {
				error!("reloading permissions from {:?} failed: {}", fname, e);
				return Err(e);
			}
		};
		let n_perms = option.upnpperms.len();
		self.replace(option.upnpperms);
		notice!(
			"permissions reloaded from {:?}: {} rules, {} skipped",
			fname,
			n_perms,
			option.skipped
		);
		Ok(n_perms)
	}
}

pub static global_perms: Lazy<PermStore> = Lazy::new(PermStore::default);
