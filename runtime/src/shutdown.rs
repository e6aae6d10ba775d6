use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Installs a `SIGINT`/`SIGTERM` handler that flips a shared flag rather than
/// terminating the process directly. Workers observe the flag at the top of each
/// vector-loop iteration (the channel-intake stage) so shutdown happens between
/// iterations, never mid-batch.
pub fn install() -> Arc<AtomicBool> {
	let flag = Arc::new(AtomicBool::new(false));

	let signalled = flag.clone();
	ctrlc::set_handler(move || signalled.store(true, Ordering::Relaxed)).expect("failed to install signal handler");

	flag
}

#[inline]
pub fn requested(flag: &AtomicBool) -> bool {
	flag.load(Ordering::Relaxed)
}
