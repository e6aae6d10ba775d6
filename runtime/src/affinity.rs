use std::io;

/// Pins the calling thread to a single CPU core. `process_thread_masks` in the
/// configuration is 1-indexed; callers are expected to subtract 1 before calling.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
	unsafe {
		let mut set: libc::cpu_set_t = std::mem::zeroed();
		libc::CPU_ZERO(&mut set);
		libc::CPU_SET(cpu, &mut set);

		let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);

		if ret != 0 {
			return Err(io::Error::last_os_error());
		}
	}

	Ok(())
}
