pub use libc::LOG_ALERT;
pub use libc::LOG_CRIT;
pub use libc::LOG_DEBUG;
pub use libc::LOG_EMERG;
pub use libc::LOG_ERR;
pub use libc::LOG_INFO;
pub use libc::LOG_NOTICE;
pub use libc::LOG_WARNING;
use libc::c_int;
use std::ffi::{CStr, CString};

pub use libc::LOG_DAEMON;
pub use libc::LOG_USER;

#[macro_export]
macro_rules! log {
	// log!(LOG_INFO, "a {} event", "log");
	($lvl:expr, $($arg:tt)+) => ({
		$crate::log::syslog_str($lvl, &std::fmt::format(format_args!($($arg)+)))
	});
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
	    #[cfg(debug_assertions)]
	    eprintln!($($arg)+);
    };
}

#[macro_export]
macro_rules! emerg {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_EMERG, $($arg)+))
}
#[macro_export]
macro_rules! alert {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_ALERT, $($arg)+))
}

#[macro_export]
macro_rules! error {
    // error!("a {} event", "log")
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_ERR, $($arg)+))
}
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_WARNING, $($arg)+))
}
#[macro_export]
macro_rules! notice {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_NOTICE, $($arg)+))
}
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_INFO, $($arg)+))
}
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => ($crate::log!($crate::log::LOG_DEBUG, $($arg)+))
}

/// Send one message to syslog.
///
/// The message never goes through the format string, rule patterns read
/// from the configuration may contain `%`.
pub fn syslog_str(priority: c_int, msg: &str) {
	let msg = CString::new(msg.bytes().filter(|&b| b != 0).collect::<Vec<u8>>()).unwrap_or_default();
	unsafe { libc::syslog(priority, c"%s".as_ptr(), msg.as_ptr()) }
}

/// mask with every priority up to and including `level`
#[inline]
pub const fn log_upto(level: c_int) -> u32 {
	(1u32 << (level + 1)) - 1
}

pub fn setlogmask(mask: u32) -> i32 {
	unsafe { libc::setlogmask(mask as c_int) }
}
pub fn openlog(ident: &'static CStr, logopt: i32, facility: c_int) {
	unsafe { libc::openlog(ident.as_ptr(), logopt as c_int, facility) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_upto() {
		assert_eq!(log_upto(LOG_EMERG), 0b1);
		assert_eq!(log_upto(LOG_NOTICE), (1 << (LOG_NOTICE + 1)) - 1);
		assert_eq!(log_upto(LOG_DEBUG), 0xff);
	}

	#[test]
	fn test_syslog_str_percent_and_nul() {
		// neither may reach syslog as format directives nor truncate into UB
		syslog_str(LOG_DEBUG, "pattern 100%s%n");
		syslog_str(LOG_DEBUG, "embedded\0nul");
		debug!("rule {} matched: {}", 3, "%x%x");
	}
}
