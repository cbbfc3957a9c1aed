//! Permission line parser.
//!
//! A permission line has the form
//! `(allow|deny) eport[-eport] ip[/mask] iport[-iport] [regex]`
//! where mask is either a bit count (`/24`) or a dotted quad
//! (`/255.255.255.0`). Everything after the fourth token is the
//! description pattern.

use crate::upnppermissions::{DescPattern, PermAction, PermissionRule};
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("invalid permission action \"{0}\", expected allow or deny")]
	InvalidAction(String),
	#[error("invalid port \"{0}\"")]
	InvalidPort(String),
	#[error("invalid port range {min}-{max}")]
	InvalidRange { min: u16, max: u16 },
	#[error("invalid IPv4 address \"{0}\"")]
	InvalidAddress(String),
	#[error("invalid subnet mask \"{0}\"")]
	InvalidSubnet(String),
	#[error("err when compiling regex \"{pattern}\": {reason}")]
	InvalidPattern { pattern: String, reason: String },
	#[error("permission rule truncated: missing {0}")]
	Truncated(&'static str),
	#[error("malformed permission rule near \"{0}\"")]
	Malformed(String),
}

/// Byte cursor over one configuration line.
///
/// Every advance is bounded by the line length, tokens are returned as
/// sub-slices of the line.
struct Cursor<'a> {
	line: &'a str,
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(line: &'a str) -> Self {
		Self { line, pos: 0 }
	}

	#[inline]
	fn peek(&self) -> Option<u8> {
		self.line.as_bytes().get(self.pos).copied()
	}

	fn take_while(&mut self, f: impl Fn(u8) -> bool) -> &'a str {
		let start = self.pos;
		while let Some(c) = self.peek() {
			if !f(c) {
				break;
			}
			self.pos += 1;
		}
		// the predicates only stop on ASCII bytes, so both ends are char boundaries
		self.line.get(start..self.pos).unwrap_or_default()
	}

	fn skip_ws(&mut self) {
		self.take_while(|c| c.is_ascii_whitespace());
	}

	/// next whitespace delimited token, `what` names it in the error
	fn token(&mut self, what: &'static str) -> Result<&'a str, ParseError> {
		self.skip_ws();
		let tok = self.take_while(|c| !c.is_ascii_whitespace());
		if tok.is_empty() {
			return Err(ParseError::Truncated(what));
		}
		Ok(tok)
	}

	fn rest(&self) -> &'a str {
		self.line.get(self.pos..).unwrap_or_default()
	}

	fn action(&mut self) -> Result<PermAction, ParseError> {
		match self.token("action")? {
			"allow" => Ok(PermAction::Allow),
			"deny" => Ok(PermAction::Deny),
			other => Err(ParseError::InvalidAction(other.to_string())),
		}
	}

	fn port_range(&mut self, what: &'static str) -> Result<(u16, u16), ParseError> {
		parse_port_range(self.token(what)?)
	}

	fn subnet(&mut self) -> Result<(Ipv4Addr, Ipv4Addr), ParseError> {
		parse_subnet(self.token("ip/mask")?)
	}

	/// rest of the line, verbatim once leading whitespace is skipped
	fn pattern(&mut self) -> Result<Option<DescPattern>, ParseError> {
		let src = self.rest().trim_start();
		self.pos = self.line.len();
		if src.is_empty() {
			return Ok(None);
		}
		DescPattern::new(src).map(Some)
	}
}

fn parse_port(s: &str) -> Result<u16, ParseError> {
	if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
		return Err(ParseError::InvalidPort(s.to_string()));
	}
	s.parse::<u16>().map_err(|_| ParseError::InvalidPort(s.to_string()))
}

/// `port` or `min-max`, inclusive
pub fn parse_port_range(s: &str) -> Result<(u16, u16), ParseError> {
	if s.bytes().filter(|&c| c == b'-').count() > 1 {
		return Err(ParseError::Malformed(s.to_string()));
	}
	let (min, max) = match s.split_once('-') {
		Some((min, max)) => (parse_port(min)?, parse_port(max)?),
		None => {
			let p = parse_port(s)?;
			(p, p)
		}
	};
	if min > max {
		return Err(ParseError::InvalidRange { min, max });
	}
	Ok((min, max))
}

fn parse_addr(s: &str) -> Result<Ipv4Addr, ParseError> {
	Ipv4Addr::from_str(s).map_err(|_| ParseError::InvalidAddress(s.to_string()))
}

/// `a.b.c.d`, `a.b.c.d/N` or `a.b.c.d/m.m.m.m`, returns (address, mask)
pub fn parse_subnet(s: &str) -> Result<(Ipv4Addr, Ipv4Addr), ParseError> {
	if s.bytes().filter(|&c| c == b'/').count() > 1 {
		return Err(ParseError::Malformed(s.to_string()));
	}
	let Some((addr, mask)) = s.split_once('/') else {
		return Ok((parse_addr(s)?, Ipv4Addr::BROADCAST));
	};
	let addr = parse_addr(addr)?;
	if !mask.is_empty() && mask.bytes().all(|c| c.is_ascii_digit()) {
		let n_bits = mask.parse::<u8>().map_err(|_| ParseError::InvalidSubnet(mask.to_string()))?;
		let net = ipnet::Ipv4Net::new(Ipv4Addr::UNSPECIFIED, n_bits)
			.map_err(|_| ParseError::InvalidSubnet(mask.to_string()))?;
		return Ok((addr, net.netmask()));
	}
	if mask.contains('.') {
		let mask = Ipv4Addr::from_str(mask).map_err(|_| ParseError::InvalidSubnet(mask.to_string()))?;
		return Ok((addr, mask));
	}
	Err(ParseError::InvalidSubnet(mask.to_string()))
}

/// Parse one permission line.
///
/// Leading whitespace is ignored, so is whitespace-only text after the
/// internal port. A pattern keeps its trailing whitespace. On any error
/// nothing of the rule is kept, including a compiled pattern.
pub fn read_permission_line(line: &str) -> Result<PermissionRule, ParseError> {
	let mut cur = Cursor::new(line);

	let action = cur.action()?;
	let (eport_min, eport_max) = cur.port_range("external port")?;
	let (address, mask) = cur.subnet()?;
	let (iport_min, iport_max) = cur.port_range("internal port")?;
	let re = cur.pattern()?;

	let perm = PermissionRule::new(action, eport_min..=eport_max, address, mask, iport_min..=iport_max, re)?;
	trace!("perm rule added : {}", perm);
	Ok(perm)
}

impl FromStr for PermissionRule {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		read_permission_line(s)
	}
}
