use std::io;
use std::os::fd::RawFd;

/// A readiness event. `token` is the opaque value passed at registration time —
/// an index into the caller's connection store, not a raw pointer, so readiness
/// dispatch never has to reconstruct an unchecked reference from the kernel.
#[derive(Clone, Copy, Debug)]
pub struct Event {
	pub token: u64,
	pub readable: bool,
	pub writable: bool,
}

/// An edge-triggered epoll instance. Each vector-loop worker owns two of these —
/// one for UDP listener fds, one for TCP fds — so that a burst of TCP activity
/// cannot starve UDP readiness or vice versa.
pub struct Epoll {
	fd: RawFd,
	raw: Vec<libc::epoll_event>,
	events: Vec<Event>,
}

impl Epoll {
	pub fn new(max_events: usize) -> io::Result<Self> {
		let fd = unsafe { libc::epoll_create1(0) };

		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(Self { fd, raw: vec![unsafe { std::mem::zeroed() }; max_events], events: Vec::with_capacity(max_events) })
	}

	fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
		let mut event = libc::epoll_event { events, u64: token };
		let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };

		if ret < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(())
	}

	pub fn register_read(&self, fd: RawFd, token: u64) -> io::Result<()> {
		self.ctl(libc::EPOLL_CTL_ADD, fd, (libc::EPOLLIN | libc::EPOLLET) as u32, token)
	}

	pub fn register_read_write(&self, fd: RawFd, token: u64) -> io::Result<()> {
		self.ctl(libc::EPOLL_CTL_ADD, fd, (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32, token)
	}

	pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
		let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };

		if ret < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(())
	}

	/// Returns readiness events without blocking. Edge-triggered semantics mean the
	/// caller must read or write until `WOULDBLOCK` before the next `wait` call can
	/// be relied on to report renewed readiness.
	pub fn wait(&mut self) -> io::Result<&[Event]> {
		let n = unsafe { libc::epoll_wait(self.fd, self.raw.as_mut_ptr(), self.raw.len() as i32, 0) };

		if n < 0 {
			let err = io::Error::last_os_error();

			if err.kind() == io::ErrorKind::Interrupted {
				self.events.clear();
				return Ok(&self.events);
			}

			return Err(err);
		}

		self.events.clear();

		for raw in &self.raw[..n as usize] {
			let events = raw.events as i32;

			self.events.push(Event {
				token: raw.u64,
				readable: events & libc::EPOLLIN != 0,
				writable: events & libc::EPOLLOUT != 0,
			});
		}

		Ok(&self.events)
	}
}

impl Drop for Epoll {
	fn drop(&mut self) {
		unsafe { libc::close(self.fd) };
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;
	use std::os::fd::AsRawFd;
	use std::os::unix::net::UnixStream;

	use super::*;

	#[test]
	fn reports_readability_after_a_write() {
		let (a, mut b) = UnixStream::pair().unwrap();
		let mut epoll = Epoll::new(8).unwrap();

		epoll.register_read(a.as_raw_fd(), 42).unwrap();
		assert!(epoll.wait().unwrap().is_empty());

		b.write_all(b"hi").unwrap();

		let events = epoll.wait().unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].token, 42);
		assert!(events[0].readable);
	}
}
