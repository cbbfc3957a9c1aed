use crate::allowbitmap::{AllowBitMap, get_permitted_ext_ports};
use crate::permparse::ParseError;
pub use crate::permparse::read_permission_line;
use arrayvec::ArrayString;
use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::net::Ipv4Addr;
use std::ops::{Deref, RangeInclusive};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PermAction {
	Allow,
	Deny,
}

impl PermAction {
	pub const fn as_str(self) -> &'static str {
		match self {
			PermAction::Allow => "allow",
			PermAction::Deny => "deny",
		}
	}
}

impl fmt::Display for PermAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Description pattern of a rule: the compiled expression and the text it
/// was compiled from, always together.
pub struct DescPattern {
	#[cfg(feature = "regex")]
	regex: regex_lite::Regex,
	source: Box<str>,
}

impl DescPattern {
	/// Compile `source` case-insensitively.
	#[cfg(feature = "regex")]
	pub fn new(source: &str) -> Result<Self, ParseError> {
		let regex = regex_lite::RegexBuilder::new(source)
			.case_insensitive(true)
			.build()
			.map_err(|e| ParseError::InvalidPattern { pattern: source.to_string(), reason: e.to_string() })?;
		Ok(Self { regex, source: source.into() })
	}

	#[cfg(not(feature = "regex"))]
	pub fn new(source: &str) -> Result<Self, ParseError> {
		Err(ParseError::InvalidPattern {
			pattern: source.to_string(),
			reason: "built without regex support".to_string(),
		})
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		&self.source
	}

	#[cfg(feature = "regex")]
	#[inline]
	pub fn is_match(&self, desc: &str) -> bool {
		self.regex.is_match(desc)
	}

	#[cfg(not(feature = "regex"))]
	#[inline]
	pub fn is_match(&self, _desc: &str) -> bool {
		true
	}
}

impl fmt::Debug for DescPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("DescPattern").field(&self.source).finish()
	}
}

impl PartialEq for DescPattern {
	fn eq(&self, other: &Self) -> bool {
		self.source == other.source
	}
}

/// One `allow`/`deny` line of the configuration.
///
/// Built by the parser and never modified afterwards.
#[derive(PartialEq, Debug)]
pub struct PermissionRule {
	action: PermAction,
	eport_min: u16,
	eport_max: u16,
	address: Ipv4Addr,
	mask: Ipv4Addr,
	iport_min: u16,
	iport_max: u16,
	re: Option<DescPattern>,
}

impl PermissionRule {
	/// Outside the crate rules are built by the parser only.
	pub(crate) fn new(
		action: PermAction,
		eports: RangeInclusive<u16>,
		address: Ipv4Addr,
		mask: Ipv4Addr,
		iports: RangeInclusive<u16>,
		re: Option<DescPattern>,
	) -> Result<Self, ParseError> {
		let (eport_min, eport_max) = eports.into_inner();
		let (iport_min, iport_max) = iports.into_inner();
		if eport_min > eport_max {
			return Err(ParseError::InvalidRange { min: eport_min, max: eport_max });
		}
		if iport_min > iport_max {
			return Err(ParseError::InvalidRange { min: iport_min, max: iport_max });
		}
		Ok(Self { action, eport_min, eport_max, address, mask, iport_min, iport_max, re })
	}

	#[inline]
	pub fn action(&self) -> PermAction {
		self.action
	}
	#[inline]
	pub fn eports(&self) -> RangeInclusive<u16> {
		self.eport_min..=self.eport_max
	}
	#[inline]
	pub fn iports(&self) -> RangeInclusive<u16> {
		self.iport_min..=self.iport_max
	}
	#[inline]
	pub fn address(&self) -> Ipv4Addr {
		self.address
	}
	#[inline]
	pub fn mask(&self) -> Ipv4Addr {
		self.mask
	}
	#[inline]
	pub fn pattern(&self) -> Option<&DescPattern> {
		self.re.as_ref()
	}

	/// internal endpoint part of the match: subnet and internal port
	#[inline]
	pub fn matches_internal(&self, address: Ipv4Addr, iport: u16) -> bool {
		if iport < self.iport_min || self.iport_max < iport {
			return false;
		}
		address & self.mask == self.address & self.mask
	}

	/// A missing description never disqualifies the rule, a present one
	/// must match the pattern if the rule has one.
	pub fn matches(&self, eport: u16, address: Ipv4Addr, iport: u16, desc: Option<&str>) -> bool {
		if eport < self.eport_min || self.eport_max < eport {
			return false;
		}
		if !self.matches_internal(address, iport) {
			return false;
		}
		match (desc, &self.re) {
			(Some(desc), Some(re)) => re.is_match(desc),
			_ => true,
		}
	}
}

fn fmt_range(f: &mut fmt::Formatter<'_>, min: u16, max: u16) -> fmt::Result {
	if min == max { write!(f, "{}", min) } else { write!(f, "{}-{}", min, max) }
}

/// Writes the rule back in configuration syntax.
impl fmt::Display for PermissionRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ", self.action)?;
		fmt_range(f, self.eport_min, self.eport_max)?;
		match ipnet::ipv4_mask_to_prefix(self.mask) {
			Ok(prefix) => write!(f, " {}/{} ", self.address, prefix)?,
			Err(_) => write!(f, " {}/{} ", self.address, self.mask)?,
		}
		fmt_range(f, self.iport_min, self.iport_max)?;
		if let Some(re) = &self.re {
			write!(f, " {}", re.as_str())?;
		}
		Ok(())
	}
}

/// Outcome of checking a mapping request against the rules.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PermCheck {
	/// rule `index` was the first to match
	Matched { index: usize, action: PermAction },
	/// nothing matched, the mapping is accepted
	Default,
}

impl PermCheck {
	#[inline]
	pub fn action(self) -> PermAction {
		match self {
			PermCheck::Matched { action, .. } => action,
			PermCheck::Default => PermAction::Allow,
		}
	}
	#[inline]
	pub fn is_allowed(self) -> bool {
		self.action() == PermAction::Allow
	}
	#[inline]
	pub fn rule_index(self) -> Option<usize> {
		match self {
			PermCheck::Matched { index, .. } => Some(index),
			PermCheck::Default => None,
		}
	}
}

pub fn check_upnp_rule_against_permissions(
	permarys: &[PermissionRule],
	eport: u16,
	address: Ipv4Addr,
	iport: u16,
	desc: Option<&str>,
) -> PermCheck {
	for (i, permary) in permarys.iter().enumerate() {
		if permary.matches(eport, address, iport, desc) {
			debug!(
				"UPnP permission rule {} matched : port mapping {}",
				i,
				if permary.action == PermAction::Allow {
					"accepted"
				} else {
					"rejected"
				}
			);
			return PermCheck::Matched { index: i, action: permary.action };
		}
	}
	debug!(
		"no permission rule matched : accept by default (n_perms={})",
		permarys.len()
	);
	PermCheck::Default /* Default : accept */
}

/// Ordered permission rules, first match wins.
#[derive(Debug, Default, PartialEq)]
pub struct RuleSet(Vec<PermissionRule>);

impl RuleSet {
	pub fn new(perms: Vec<PermissionRule>) -> Self {
		Self(perms)
	}

	/// Parse every line, failing on the first bad one.
	pub fn from_lines<I, S>(lines: I) -> Result<Self, ParseError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		lines.into_iter().map(|l| read_permission_line(l.as_ref())).collect()
	}

	#[inline]
	pub fn evaluate(&self, eport: u16, address: Ipv4Addr, iport: u16, desc: Option<&str>) -> PermCheck {
		check_upnp_rule_against_permissions(&self.0, eport, address, iport, desc)
	}

	#[inline]
	pub fn permitted_external_ports(&self, address: Ipv4Addr, iport: u16) -> AllowBitMap {
		get_permitted_ext_ports(&self.0, address, iport)
	}

	pub fn into_vec(self) -> Vec<PermissionRule> {
		self.0
	}
}

impl Deref for RuleSet {
	type Target = [PermissionRule];

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl FromIterator<PermissionRule> for RuleSet {
	fn from_iter<T: IntoIterator<Item = PermissionRule>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

/// Dump the rules, one per line:
/// `NN action emin-emax AAAAAAAA/MMMMMMMM imin-imax[ regex]`
pub fn write_permlist<W: io::Write>(w: &mut W, permary: &[PermissionRule]) -> io::Result<()> {
	w.write_all(b"Permissions :\n")?;
	for (i, perm) in permary.iter().enumerate() {
		let mut buf = ArrayString::<128>::new();
		buf.write_fmt(format_args!(
			"{:02} {} {}-{} {:08x}/{:08x} {}-{}",
			i,
			perm.action,
			perm.eport_min,
			perm.eport_max,
			u32::from(perm.address),
			u32::from(perm.mask),
			perm.iport_min,
			perm.iport_max
		))
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "permission line too long"))?;
		w.write_all(buf.as_bytes())?;
		if let Some(re) = &perm.re {
			w.write_all(b" ")?;
			w.write_all(re.as_str().as_bytes())?;
		}
		w.write_all(b"\n")?;
	}
	Ok(())
}
