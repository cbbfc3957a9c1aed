#![allow(non_upper_case_globals)]

//! Port mapping permission rules of the miniupnpd daemon.
//!
//! A rule list decides whether a UPnP / NAT-PMP / PCP client may map an
//! external port to an internal `address:port`, and which external ports an
//! internal endpoint may get at all.

#[macro_use]
pub mod log;

pub mod allowbitmap;
pub mod options;
pub mod permparse;
pub mod upnppermissions;

pub use allowbitmap::AllowBitMap;
pub use permparse::ParseError;
pub use upnppermissions::{
	PermAction, PermCheck, PermissionRule, RuleSet, check_upnp_rule_against_permissions, read_permission_line,
};
