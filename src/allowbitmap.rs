//! Allowed external ports of one internal endpoint, one bit per port.

use crate::upnppermissions::{PermAction, PermissionRule};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

pub const PORT_COUNT: usize = 65536;
const WORDS: usize = PORT_COUNT / 32;

#[derive(Clone, PartialEq, Eq)]
pub struct AllowBitMap([u32; WORDS]);

/// Everything allowed, like an empty rule list.
impl Default for AllowBitMap {
	#[inline]
	fn default() -> Self {
		Self::all_allowed()
	}
}

impl fmt::Debug for AllowBitMap {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AllowBitMap").field("allowed", &self.count_allowed()).finish()
	}
}

impl AllowBitMap {
	#[inline]
	pub const fn all_allowed() -> Self {
		Self([u32::MAX; WORDS])
	}
	#[inline]
	pub const fn all_denied() -> Self {
		Self([0; WORDS])
	}

	#[inline]
	pub fn set(&mut self, index: u16) {
		self.0[index as usize / 32] |= 1 << (index % 32);
	}
	#[inline]
	pub fn get(&self, index: u16) -> bool {
		self.0[index as usize / 32] & (1 << (index % 32)) != 0
	}
	#[inline]
	pub fn clear(&mut self, index: u16) {
		self.0[index as usize / 32] &= !(1 << (index % 32));
	}

	/// Allow the 32 ports starting at `base`, which must be 32-aligned.
	#[inline]
	pub fn set_block(&mut self, base: u16) {
		debug_assert_eq!(base % 32, 0);
		self.0[base as usize / 32] = u32::MAX;
	}
	/// Deny the 32 ports starting at `base`, which must be 32-aligned.
	#[inline]
	pub fn clear_block(&mut self, base: u16) {
		debug_assert_eq!(base % 32, 0);
		self.0[base as usize / 32] = 0;
	}

	/// Set `min..=max` to `allowed`.
	///
	/// Whole words are written while the cursor is 32-aligned and at least
	/// 32 ports remain, single bits otherwise.
	pub fn fill_range(&mut self, min: u16, max: u16, allowed: bool) {
		// u32 cursor, max may be 65535
		let mut j = min as u32;
		let max = max as u32;
		while j <= max {
			if j % 32 == 0 && max >= j + 31 {
				if allowed {
					self.set_block(j as u16);
				} else {
					self.clear_block(j as u16);
				}
				j += 32;
			} else {
				if allowed {
					self.set(j as u16);
				} else {
					self.clear(j as u16);
				}
				j += 1;
			}
		}
	}

	pub fn count_allowed(&self) -> usize {
		self.0.iter().map(|w| w.count_ones() as usize).sum()
	}

	pub fn iter_allowed(&self) -> impl Iterator<Item = u16> + '_ {
		(0..=u16::MAX).filter(|&p| self.get(p))
	}

	/// maximal runs of allowed ports, ascending
	pub fn ranges(&self) -> Vec<RangeInclusive<u16>> {
		let mut ranges = vec![];
		let mut start: Option<u16> = None;
		for p in 0..=u16::MAX {
			match (self.get(p), start) {
				(true, None) => start = Some(p),
				(false, Some(s)) => {
					ranges.push(s..=p - 1);
					start = None;
				}
				_ => {}
			}
		}
		if let Some(s) = start {
			ranges.push(s..=u16::MAX);
		}
		ranges
	}

	/// Allowed ports to try once `eport` has been refused, in the order
	/// AddAnyPortMapping walks them: alternately above and below `eport`,
	/// starting above, never reaching port 0.
	pub fn candidates(&self, eport: u16) -> Candidates<'_> {
		Candidates { allowed: self, last: eport, below: eport, above: eport }
	}

	/// `eport` itself if allowed and accepted by `is_free`, else the first
	/// such port of [`candidates`](Self::candidates).
	pub fn pick_port<F>(&self, eport: u16, mut is_free: F) -> Option<u16>
	where
		F: FnMut(u16) -> bool,
	{
		if self.get(eport) && is_free(eport) {
			return Some(eport);
		}
		self.candidates(eport).find(|&p| is_free(p))
	}
}

pub struct Candidates<'a> {
	allowed: &'a AllowBitMap,
	last: u16,
	below: u16,
	above: u16,
}

impl Iterator for Candidates<'_> {
	type Item = u16;

	fn next(&mut self) -> Option<u16> {
		loop {
			if self.below <= 1 && self.above == u16::MAX {
				return None;
			}
			if self.above == u16::MAX || (self.last > self.below && self.below > 1) {
				self.below -= 1;
				self.last = self.below;
			} else {
				self.above += 1;
				self.last = self.above;
			}
			if self.allowed.get(self.last) {
				return Some(self.last);
			}
		}
	}
}

/// Build the allowed external ports of `addr:iport`.
///
/// Rules are applied from last to first, each one overwriting its external
/// range, so the first matching rule in list order decides every port.
pub fn get_permitted_ext_ports(permary: &[PermissionRule], addr: Ipv4Addr, iport: u16) -> AllowBitMap {
	// everything allowed by default
	let mut allowed = AllowBitMap::all_allowed();

	for perm in permary.iter().rev() {
		if !perm.matches_internal(addr, iport) {
			continue;
		}
		let eports = perm.eports();
		allowed.fill_range(*eports.start(), *eports.end(), perm.action() == PermAction::Allow);
	}
	allowed
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::upnppermissions::RuleSet;

	fn naive_fill(map: &mut AllowBitMap, min: u16, max: u16, allowed: bool) {
		for p in min..=max {
			if allowed {
				map.set(p);
			} else {
				map.clear(p);
			}
		}
	}

	fn ip(s: &str) -> Ipv4Addr {
		s.parse().unwrap()
	}

	#[test]
	fn test_bit_ops() {
		let mut map = AllowBitMap::all_denied();
		assert_eq!(map.count_allowed(), 0);
		map.set(0);
		map.set(31);
		map.set(32);
		map.set(65535);
		assert!(map.get(0) && map.get(31) && map.get(32) && map.get(65535));
		assert!(!map.get(1) && !map.get(33));
		map.clear(31);
		assert!(!map.get(31));
		map.set_block(64);
		assert!((64..96).all(|p| map.get(p)));
		assert!(!map.get(63) && !map.get(96));
		map.clear_block(64);
		assert_eq!(map.count_allowed(), 3);
		assert_eq!(AllowBitMap::default().count_allowed(), PORT_COUNT);
	}

	#[test]
	fn test_fill_range_matches_naive() {
		let ranges = [
			(10, 100),
			(0, 31),
			(0, 32),
			(1, 65535),
			(0, 65535),
			(31, 32),
			(32, 63),
			(33, 62),
			(65504, 65535),
			(65503, 65535),
			(65535, 65535),
			(0, 0),
			(1000, 1000),
		];
		for (min, max) in ranges {
			for allowed in [true, false] {
				for start in [AllowBitMap::all_allowed(), AllowBitMap::all_denied()] {
					let mut fast = start.clone();
					let mut slow = start;
					fast.fill_range(min, max, allowed);
					naive_fill(&mut slow, min, max, allowed);
					assert!(fast == slow, "fill_range({min}, {max}, {allowed})");
				}
			}
		}
	}

	#[test]
	fn test_fill_range_leaves_outside_alone() {
		let mut map = AllowBitMap::all_allowed();
		map.fill_range(10, 100, false);
		assert!(map.get(9) && map.get(101));
		assert!(!map.get(10) && !map.get(32) && !map.get(63) && !map.get(100));
		assert_eq!(map.count_allowed(), PORT_COUNT - 91);
	}

	#[test]
	fn test_permitted_ext_ports() {
		let perms = RuleSet::from_lines([
			"allow 1024-65535 192.168.0.0/16 1024-65535",
			"deny 0-65535 0.0.0.0/0 0-65535",
		])
		.unwrap();

		let lan = perms.permitted_external_ports(ip("192.168.0.10"), 8080);
		assert_eq!(lan.ranges(), vec![1024..=65535]);

		// internal port outside the first rule
		let low = perms.permitted_external_ports(ip("192.168.0.10"), 80);
		assert_eq!(low.count_allowed(), 0);

		let wan = perms.permitted_external_ports(ip("10.0.0.5"), 8080);
		assert_eq!(wan.count_allowed(), 0);

		let empty = RuleSet::default().permitted_external_ports(ip("10.0.0.5"), 1);
		assert_eq!(empty.count_allowed(), PORT_COUNT);
	}

	#[test]
	fn test_permitted_ext_ports_first_rule_wins() {
		let perms = RuleSet::from_lines(["deny 100-200 0.0.0.0/0 0-65535", "allow 0-65535 0.0.0.0/0 0-65535"]).unwrap();
		let map = perms.permitted_external_ports(ip("1.2.3.4"), 5);
		assert_eq!(map.ranges(), vec![0..=99, 201..=65535]);
	}

	#[test]
	fn test_candidates_order() {
		let map = AllowBitMap::all_allowed();
		let first: Vec<u16> = map.candidates(1000).take(6).collect();
		assert_eq!(first, vec![1001, 999, 1002, 998, 1003, 997]);

		// never port 0 and never the requested port again
		let all: Vec<u16> = map.candidates(3).collect();
		assert_eq!(all.len(), 65535 - 1);
		assert!(!all.contains(&0) && !all.contains(&3));
		assert_eq!(&all[..4], &[4, 2, 5, 1]);

		let top: Vec<u16> = map.candidates(65535).take(3).collect();
		assert_eq!(top, vec![65534, 65533, 65532]);
		assert_eq!(map.candidates(65535).count(), 65534);
	}

	#[test]
	fn test_pick_port() {
		let mut map = AllowBitMap::all_denied();
		map.fill_range(2000, 2010, true);
		assert_eq!(map.iter_allowed().collect::<Vec<_>>(), (2000..=2010).collect::<Vec<u16>>());
		assert_eq!(map.pick_port(2005, |_| true), Some(2005));
		assert_eq!(map.pick_port(2005, |p| p != 2005), Some(2006));
		assert_eq!(map.pick_port(80, |_| true), Some(2000));
		assert_eq!(map.pick_port(80, |p| p > 2009), Some(2010));
		assert_eq!(map.pick_port(80, |_| false), None);
		assert_eq!(AllowBitMap::all_denied().pick_port(80, |_| true), None);
	}
}

#[cfg(test)]
mod proptests {
	use super::*;
	use crate::upnppermissions::{PermAction, RuleSet};
	use proptest::prelude::*;

	fn port_range() -> impl Strategy<Value = (u16, u16)> {
		any::<u16>().prop_flat_map(|min| (Just(min), min..=u16::MAX))
	}

	fn rule() -> impl Strategy<Value = PermissionRule> {
		(
			any::<bool>(),
			port_range(),
			// a few subnets around the tested addresses
			prop::sample::select(vec!["0.0.0.0/0", "192.168.0.0/16", "192.168.1.0/24", "192.168.1.5", "10.0.0.0/8"]),
			port_range(),
		)
			.prop_map(|(allow, (emin, emax), net, (imin, imax))| {
				let line = format!("{} {}-{} {} {}-{}", if allow { "allow" } else { "deny" }, emin, emax, net, imin, imax);
				read_line(&line)
			})
	}

	fn read_line(line: &str) -> PermissionRule {
		crate::permparse::read_permission_line(line).unwrap()
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(32))]

		#[test]
		fn prop_bitmap_matches_evaluate(
			perms in prop::collection::vec(rule(), 0..6),
			addr in prop::sample::select(vec!["192.168.1.5", "192.168.2.9", "10.1.2.3", "8.8.8.8"]),
			iport in any::<u16>(),
		) {
			// 65536 evaluations per case, keep their debug lines out of syslog
			crate::log::setlogmask(crate::log::log_upto(crate::log::LOG_INFO));
			let perms: RuleSet = perms.into_iter().collect();
			let addr: Ipv4Addr = addr.parse().unwrap();
			let map = perms.permitted_external_ports(addr, iport);
			for eport in 0..=u16::MAX {
				let allowed = perms.evaluate(eport, addr, iport, None).action() == PermAction::Allow;
				prop_assert_eq!(map.get(eport), allowed, "eport {}", eport);
			}
		}

		#[test]
		fn prop_fill_range_matches_naive((min, max) in port_range(), allowed in any::<bool>(), seed in any::<u32>()) {
			let mut fast = AllowBitMap::all_denied();
			for (i, w) in fast.0.iter_mut().enumerate() {
				*w = seed.rotate_left(i as u32);
			}
			let mut slow = fast.clone();
			fast.fill_range(min, max, allowed);
			for p in min..=max {
				if allowed { slow.set(p) } else { slow.clear(p) }
			}
			prop_assert!(fast == slow);
		}
	}
}
