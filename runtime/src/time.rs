use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch, used for log timestamps and resource poll scheduling.
pub fn unix_now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock should be after the UNIX epoch")
		.as_secs()
		.try_into()
		.expect("32-bit UNIX time should not overflow")
}

/// Nanoseconds since the UNIX epoch, for wall-clock query-log timestamps
/// (RFC3339 with nanosecond precision).
pub fn unix_now_ns() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock should be after the UNIX epoch")
		.as_nanos()
		.try_into()
		.expect("nanosecond UNIX time should not overflow u64")
}

/// A monotonic clock for deadline arithmetic (connection timeouts, the
/// idle-backoff sweep), immune to wall-clock adjustments. Nanoseconds since
/// an arbitrary process-wide origin fixed on first use, so deadlines set on
/// one thread compare correctly against a later read on any other. Only
/// differences between two calls are meaningful.
pub fn monotonic_now_ns() -> u64 {
	static ORIGIN: OnceLock<Instant> = OnceLock::new();
	ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
