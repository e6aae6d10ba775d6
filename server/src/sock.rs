//! Raw-`libc` socket setup and I/O. `std::net` does not expose `SO_REUSEPORT`,
//! `IP_PKTINFO`/`IPV6_RECVPKTINFO`, ancillary `recvmsg`/`sendmsg` data, or the
//! batched `recvmmsg`/`sendmmsg` the UDP hot path needs to amortize one
//! syscall across a whole vector of datagrams, so every socket here is built
//! and driven directly against the raw fd, the same way [`runtime::epoll`]
//! drives `epoll_wait` directly.

use std::io;
use std::mem::{size_of, zeroed, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use utils::sockaddr::SocketAddr;

fn check(ret: i32) -> io::Result<i32> {
	if ret < 0 {
		Err(io::Error::last_os_error())
	} else {
		Ok(ret)
	}
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
	let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
	check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
	Ok(())
}

fn setsockopt<T>(fd: RawFd, level: i32, name: i32, value: T) -> io::Result<()> {
	let ret = unsafe { libc::setsockopt(fd, level, name, &value as *const T as *const libc::c_void, size_of::<T>() as libc::socklen_t) };
	check(ret)?;
	Ok(())
}

fn sockaddr_storage(addr: IpAddr, port: u16) -> (libc::sockaddr_storage, libc::socklen_t) {
	let mut storage: libc::sockaddr_storage = unsafe { zeroed() };

	match addr {
		IpAddr::V4(addr) => {
			let sin = libc::sockaddr_in {
				sin_family: libc::AF_INET as libc::sa_family_t,
				sin_port: port.to_be(),
				sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) },
				sin_zero: [0; 8],
			};

			unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
			(storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
		}
		IpAddr::V6(addr) => {
			let sin6 = libc::sockaddr_in6 {
				sin6_family: libc::AF_INET6 as libc::sa_family_t,
				sin6_port: port.to_be(),
				sin6_flowinfo: 0,
				sin6_addr: libc::in6_addr { s6_addr: addr.octets() },
				sin6_scope_id: 0,
			};

			unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
			(storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
		}
	}
}

/// SAFETY: `storage` must have been populated by the kernel (via `accept`,
/// `getsockname`, or `recvmsg`) or by [`sockaddr_storage`], and `len` must be
/// the length the kernel reported for it.
unsafe fn decode_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
	match storage.ss_family as i32 {
		libc::AF_INET if len as usize >= size_of::<libc::sockaddr_in>() => {
			let sin = &*(storage as *const _ as *const libc::sockaddr_in);
			let addr = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
			Some(SocketAddr::new(IpAddr::V4(addr), u16::from_be(sin.sin_port)))
		}
		libc::AF_INET6 if len as usize >= size_of::<libc::sockaddr_in6>() => {
			let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
			let addr = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
			Some(SocketAddr::new(IpAddr::V6(addr), u16::from_be(sin6.sin6_port)))
		}
		_ => None,
	}
}

/// Which IP family a listener binds to. Each enabled family gets its own
/// socket, per the connection model's "for each enabled family and protocol"
/// listener creation rule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
	V4,
	V6,
}

impl Family {
	fn unspecified(self) -> IpAddr {
		match self {
			Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
		}
	}
}

fn new_socket(family: Family, ty: i32) -> io::Result<OwnedFd> {
	let domain = match family {
		Family::V4 => libc::AF_INET,
		Family::V6 => libc::AF_INET6,
	};

	let fd = check(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) })?;
	Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind(fd: RawFd, family: Family, port: u16) -> io::Result<()> {
	let (storage, len) = sockaddr_storage(family.unspecified(), port);
	check(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
	Ok(())
}

/// Creates a non-blocking UDP listener bound to the wildcard address on
/// `port`, with `SO_REUSEADDR`/`SO_REUSEPORT` (so multiple workers can share
/// the port) and destination-address delivery enabled so the response can be
/// sent from the same local address the request arrived on.
pub fn udp_listener(family: Family, port: u16, recvbuf: usize, sendbuf: usize) -> io::Result<OwnedFd> {
	let fd = new_socket(family, libc::SOCK_DGRAM)?;
	let raw = fd.as_raw_fd();

	setsockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1i32)?;
	setsockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1i32)?;
	setsockopt(raw, libc::SOL_SOCKET, libc::SO_RCVBUF, recvbuf as i32)?;
	setsockopt(raw, libc::SOL_SOCKET, libc::SO_SNDBUF, sendbuf as i32)?;

	match family {
		Family::V4 => setsockopt(raw, libc::IPPROTO_IP, libc::IP_PKTINFO, 1i32)?,
		Family::V6 => {
			setsockopt(raw, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1i32)?;
			setsockopt(raw, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1i32)?;
		}
	}

	bind(raw, family, port)?;
	set_nonblocking(raw)?;

	Ok(fd)
}

/// Creates a non-blocking, listening TCP socket bound to the wildcard address
/// on `port` with the given accept backlog.
pub fn tcp_listener(family: Family, port: u16, backlog: usize) -> io::Result<OwnedFd> {
	let fd = new_socket(family, libc::SOCK_STREAM)?;
	let raw = fd.as_raw_fd();

	setsockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1i32)?;
	setsockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1i32)?;

	if family == Family::V6 {
		setsockopt(raw, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1i32)?;
	}

	bind(raw, family, port)?;
	check(unsafe { libc::listen(raw, backlog as i32) })?;
	set_nonblocking(raw)?;

	Ok(fd)
}

/// One accepted connection: its socket plus the client and local addresses,
/// captured at accept time rather than re-queried per query.
pub struct Accepted {
	pub fd: OwnedFd,
	pub client: SocketAddr,
	pub local: SocketAddr,
}

/// Result of one `accept_burst` call: the connections that were fully
/// resolved, plus how many were dropped because `decode_sockaddr` didn't
/// recognize the client's or the accepted socket's own local address family.
/// Counted separately since the two correspond to different metrics.
#[derive(Default)]
pub struct AcceptOutcome {
	pub accepted: Vec<Accepted>,
	pub unknown_client_family: usize,
	pub unknown_local_family: usize,
}

/// Accepts up to `max` pending connections without blocking. Stops early on
/// `EAGAIN`/`EWOULDBLOCK`; any other error is returned immediately, matching
/// `io::Result` propagation used throughout this crate's socket layer. A
/// connection whose client or local address is in a family this server
/// doesn't decode is dropped (fd closed via `Drop`) rather than aborting the
/// whole batch.
pub fn accept_burst(listener_fd: RawFd, max: usize) -> io::Result<AcceptOutcome> {
	let mut out = AcceptOutcome::default();

	for _ in 0..max {
		let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
		let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

		let fd = unsafe { libc::accept4(listener_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len, libc::SOCK_CLOEXEC) };

		if fd < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::WouldBlock {
				break;
			}
			return Err(err);
		}

		let fd = unsafe { OwnedFd::from_raw_fd(fd) };
		set_nonblocking(fd.as_raw_fd())?;

		let Some(client) = (unsafe { decode_sockaddr(&storage, len) }) else {
			out.unknown_client_family += 1;
			continue;
		};

		let mut local_storage: libc::sockaddr_storage = unsafe { zeroed() };
		let mut local_len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
		check(unsafe { libc::getsockname(fd.as_raw_fd(), &mut local_storage as *mut _ as *mut libc::sockaddr, &mut local_len) })?;

		let Some(local) = (unsafe { decode_sockaddr(&local_storage, local_len) }) else {
			out.unknown_local_family += 1;
			continue;
		};

		out.accepted.push(Accepted { fd, client, local });
	}

	Ok(out)
}

pub fn getsockname(fd: RawFd) -> io::Result<SocketAddr> {
	let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
	let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

	check(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;

	unsafe { decode_sockaddr(&storage, len) }.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
}

pub fn set_tcp_buffers(fd: RawFd, recvbuf: usize, sendbuf: usize) -> io::Result<()> {
	setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, recvbuf as i32)?;
	setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, sendbuf as i32)?;
	Ok(())
}

const CMSG_BUF_LEN: usize = 128;

/// SAFETY: `msg` must be a `msghdr` just populated by a successful
/// `recvmsg`/`recvmmsg` call whose `msg_control` buffer is still alive.
unsafe fn extract_pktinfo(msg: &libc::msghdr) -> Option<IpAddr> {
	let mut cmsg = libc::CMSG_FIRSTHDR(msg);

	while !cmsg.is_null() {
		let hdr = &*cmsg;

		if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
			let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
			return Some(IpAddr::V4(Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes())));
		}

		if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
			let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
			return Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
		}

		cmsg = libc::CMSG_NXTHDR(msg, cmsg);
	}

	None
}

/// One datagram received by [`recv_udp_batch`], at the same index its
/// receiving buffer held in the `bufs` slice passed in.
pub struct UdpBatchDatagram {
	pub len: usize,
	pub client: SocketAddr,
	pub local: IpAddr,
}

/// Receives up to `bufs.len()` datagrams in a single `recvmmsg` call. Returns
/// one entry per datagram actually delivered, in receive order, aligned to
/// `bufs` by index; fewer entries than `bufs.len()` means the socket is
/// drained for now. A datagram from a family this server doesn't decode is
/// reported with `local` equal to `wildcard_local` rather than dropped,
/// since unlike `accept_burst` there is no separate fd to simply not keep.
pub fn recv_udp_batch(fd: RawFd, bufs: &mut [&mut [u8]], wildcard_local: IpAddr) -> io::Result<Vec<UdpBatchDatagram>> {
	let n = bufs.len();
	if n == 0 {
		return Ok(Vec::new());
	}

	let mut storages: Vec<libc::sockaddr_storage> = (0..n).map(|_| unsafe { zeroed() }).collect();
	let mut cmsgs: Vec<[MaybeUninit<u8>; CMSG_BUF_LEN]> = (0..n).map(|_| [MaybeUninit::uninit(); CMSG_BUF_LEN]).collect();
	let mut iovs: Vec<libc::iovec> = bufs.iter_mut().map(|buf| libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() }).collect();
	let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(n);

	for i in 0..n {
		let mut msg: libc::msghdr = unsafe { zeroed() };
		msg.msg_name = &mut storages[i] as *mut _ as *mut libc::c_void;
		msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
		msg.msg_iov = &mut iovs[i];
		msg.msg_iovlen = 1;
		msg.msg_control = cmsgs[i].as_mut_ptr() as *mut libc::c_void;
		msg.msg_controllen = CMSG_BUF_LEN as _;
		hdrs.push(libc::mmsghdr { msg_hdr: msg, msg_len: 0 });
	}

	let received = unsafe { libc::recvmmsg(fd, hdrs.as_mut_ptr(), n as u32, libc::MSG_DONTWAIT, std::ptr::null_mut()) };

	if received < 0 {
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::WouldBlock {
			return Ok(Vec::new());
		}
		return Err(err);
	}

	let mut out = Vec::with_capacity(received as usize);

	for (i, hdr) in hdrs.iter().enumerate().take(received as usize) {
		let client = unsafe { decode_sockaddr(&storages[i], hdr.msg_hdr.msg_namelen) }.unwrap_or(SocketAddr::new(wildcard_local, 0));
		let local = unsafe { extract_pktinfo(&hdr.msg_hdr) }.unwrap_or(wildcard_local);
		out.push(UdpBatchDatagram { len: hdr.msg_len as usize, client, local });
	}

	Ok(out)
}

/// Sends up to `msgs.len()` datagrams (buffer, destination, source address)
/// in a single `sendmmsg` call. Returns how many were actually accepted by
/// the kernel; a short count (including zero on `EAGAIN`/`EWOULDBLOCK`)
/// means the remainder should be retried on a later call.
pub fn send_udp_batch(fd: RawFd, msgs: &[(&[u8], SocketAddr, IpAddr)]) -> io::Result<usize> {
	let n = msgs.len();
	if n == 0 {
		return Ok(0);
	}

	let mut storages = Vec::with_capacity(n);
	let mut lens = Vec::with_capacity(n);
	for (_, dest, _) in msgs {
		let (storage, len) = sockaddr_storage(dest.addr, dest.port);
		storages.push(storage);
		lens.push(len);
	}

	let mut cmsgs: Vec<[MaybeUninit<u8>; CMSG_BUF_LEN]> = (0..n).map(|_| [MaybeUninit::uninit(); CMSG_BUF_LEN]).collect();
	let mut iovs: Vec<libc::iovec> = msgs.iter().map(|(buf, _, _)| libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() }).collect();
	let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(n);

	for i in 0..n {
		let controllen = match msgs[i].2 {
			IpAddr::V4(addr) => unsafe { write_pktinfo_v4(&mut cmsgs[i], addr) },
			IpAddr::V6(addr) => unsafe { write_pktinfo_v6(&mut cmsgs[i], addr) },
		};

		let mut msg: libc::msghdr = unsafe { zeroed() };
		msg.msg_name = &mut storages[i] as *mut _ as *mut libc::c_void;
		msg.msg_namelen = lens[i];
		msg.msg_iov = &mut iovs[i];
		msg.msg_iovlen = 1;
		msg.msg_control = cmsgs[i].as_mut_ptr() as *mut libc::c_void;
		msg.msg_controllen = controllen as _;
		hdrs.push(libc::mmsghdr { msg_hdr: msg, msg_len: 0 });
	}

	let sent = unsafe { libc::sendmmsg(fd, hdrs.as_mut_ptr(), n as u32, 0) };

	if sent < 0 {
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::WouldBlock {
			return Ok(0);
		}
		return Err(err);
	}

	Ok(sent as usize)
}

unsafe fn write_pktinfo_v4(buf: &mut [MaybeUninit<u8>; CMSG_BUF_LEN], addr: Ipv4Addr) -> usize {
	let mut msg: libc::msghdr = zeroed();
	msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
	msg.msg_controllen = size_of::<libc::cmsghdr>() + size_of::<libc::in_pktinfo>();

	let cmsg = libc::CMSG_FIRSTHDR(&msg);
	(*cmsg).cmsg_level = libc::IPPROTO_IP;
	(*cmsg).cmsg_type = libc::IP_PKTINFO;
	(*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::in_pktinfo>() as u32) as _;

	let info = libc::in_pktinfo { ipi_ifindex: 0, ipi_spec_dst: libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) }, ipi_addr: libc::in_addr { s_addr: 0 } };
	std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, info);

	msg.msg_controllen as usize
}

unsafe fn write_pktinfo_v6(buf: &mut [MaybeUninit<u8>; CMSG_BUF_LEN], addr: Ipv6Addr) -> usize {
	let mut msg: libc::msghdr = zeroed();
	msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
	msg.msg_controllen = size_of::<libc::cmsghdr>() + size_of::<libc::in6_pktinfo>();

	let cmsg = libc::CMSG_FIRSTHDR(&msg);
	(*cmsg).cmsg_level = libc::IPPROTO_IPV6;
	(*cmsg).cmsg_type = libc::IPV6_PKTINFO;
	(*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::in6_pktinfo>() as u32) as _;

	let info = libc::in6_pktinfo { ipi6_addr: libc::in6_addr { s6_addr: addr.octets() }, ipi6_ifindex: 0 };
	std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, info);

	msg.msg_controllen as usize
}

/// Reads from a connected TCP socket without blocking. `Ok(0)` means the
/// peer closed its write side; `Ok(None)` from the caller's perspective
/// comes from a `WouldBlock` error, not a zero-length `Ok`, to keep "closed"
/// and "no data yet" distinguishable.
pub fn read_tcp(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
	let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
	if n < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(n as usize)
}

pub fn write_tcp(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
	let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
	if n < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(n as usize)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn udp_listener_binds_and_reports_local_port() {
		let fd = udp_listener(Family::V4, 0, 4096, 4096).unwrap();
		let local = getsockname(fd.as_raw_fd()).unwrap();
		assert!(local.port > 0);
	}

	#[test]
	fn tcp_listener_accepts_a_loopback_connection() {
		let listener = tcp_listener(Family::V4, 0, 16).unwrap();
		let local = getsockname(listener.as_raw_fd()).unwrap();

		let client = std::net::TcpStream::connect(std::net::SocketAddr::from(local)).unwrap();

		// The listener is non-blocking and edge-triggered in production, but a
		// freshly connected loopback peer is already acceptable without a wait.
		std::thread::sleep(std::time::Duration::from_millis(10));

		let outcome = accept_burst(listener.as_raw_fd(), 4).unwrap();
		assert_eq!(outcome.accepted.len(), 1);
		drop(client);
	}
}
