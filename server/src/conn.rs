//! The connection model: TCP connections, the FIFOs that move them between
//! pipeline stages, and the LRU used for timeout sweeps.
//!
//! An intrusive singly-linked FIFO with boolean membership flags would need
//! an unchecked pointer to a list node, which safe Rust has no way to hand
//! out. Queues here are instead a `VecDeque<Key>` guarded by the same kind
//! of idempotency flag, now stored on the pooled connection itself, with
//! the same "drain and refill" removal technique.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use collections::pool::{Key, Pool};
use collections::lru::Lru;
use utils::sockaddr::SocketAddr;

use crate::query::{Protocol, Query};

/// One of the states a TCP connection moves through between a completed read
/// and its next one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpState {
	WaitForQuery,
	WaitForQueryData,
	Reading,
	Parsing,
	Resolving,
	Packing,
	Writing,
	ClosedForRead,
	ClosedForWrite,
	ReadErr,
	WriteErr,
	QuerySizeTooLarge,
	AssignConnIdErr,
}

/// Membership flags, one per FIFO a connection can be queued on, kept on the
/// connection so enqueue is idempotent without scanning the queue.
#[derive(Default, Clone, Copy)]
struct Membership {
	read: bool,
	write: bool,
	pipeline: bool,
	release: bool,
}

pub struct TcpConn {
	pub fd: OwnedFd,
	pub client_ip: SocketAddr,
	pub local_ip: SocketAddr,
	pub state: TcpState,
	pub deadline_ns: u64,

	/// Bytes read but not yet consumed into a framed query.
	pub read_buffer: Vec<u8>,
	/// Fixed pool of `tcp_conn_simultaneous_queries_count` query slots,
	/// allocated once at accept time and reset (never reallocated) between
	/// uses, the same way [`crate::worker::UdpListener::vector`] is.
	pub queries: Vec<Query>,
	/// Number of leading slots in `queries` holding an in-flight query.
	pub query_count: usize,
	/// Index of the next query to attempt writing.
	pub write_index: usize,
	/// Byte offset already written of `queries[write_index]`'s response.
	pub byte_index: usize,
	/// Total queries framed over the connection's lifetime, used at release
	/// to tell "closed before any query arrived" from "closed mid-query".
	pub queries_seen: u64,

	membership: Membership,
}

impl TcpConn {
	fn new(fd: OwnedFd, client_ip: SocketAddr, local_ip: SocketAddr, sim_queries: usize) -> Self {
		Self {
			fd,
			client_ip,
			local_ip,
			state: TcpState::WaitForQuery,
			deadline_ns: 0,
			read_buffer: Vec::new(),
			queries: (0..sim_queries).map(|_| Query::new(Protocol::Tcp)).collect(),
			query_count: 0,
			write_index: 0,
			byte_index: 0,
			queries_seen: 0,
			membership: Membership::default(),
		}
	}

	pub fn raw_fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

/// A readiness-registration token. `Epoll`'s `u64` token field carries this
/// packed into the top two bits as a kind tag plus a payload: a small fixed
/// id for listeners, or a pool key's index/generation pair for TCP
/// connections (see [`Token::pack`]/[`Token::unpack`]).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Token {
	UdpListener(usize),
	TcpListener(usize),
	TcpConn(Key),
}

const KIND_UDP_LISTENER: u64 = 0;
const KIND_TCP_LISTENER: u64 = 1;
const KIND_TCP_CONN: u64 = 2;

const INDEX_BITS: u32 = 31;
const GEN_MASK: u64 = (1 << INDEX_BITS) - 1;

impl Token {
	pub fn pack(self) -> u64 {
		match self {
			Token::UdpListener(i) => (KIND_UDP_LISTENER << 62) | i as u64,
			Token::TcpListener(i) => (KIND_TCP_LISTENER << 62) | i as u64,
			Token::TcpConn(key) => {
				let (index, generation) = key.raw();
				(KIND_TCP_CONN << 62) | ((index as u64 & GEN_MASK) << INDEX_BITS) | (generation as u64 & GEN_MASK)
			}
		}
	}

	pub fn unpack(raw: u64) -> Self {
		let kind = raw >> 62;
		let payload = raw & ((1 << 62) - 1);

		match kind {
			KIND_UDP_LISTENER => Token::UdpListener(payload as usize),
			KIND_TCP_LISTENER => Token::TcpListener(payload as usize),
			_ => {
				let index = ((payload >> INDEX_BITS) & GEN_MASK) as u32;
				let generation = (payload & GEN_MASK) as u32;
				Token::TcpConn(Key::from_raw(index, generation))
			}
		}
	}
}

/// A FIFO of pool keys with idempotent enqueue. In-place removal has no safe
/// cheap implementation over a `VecDeque`, so callers needing it pop
/// everything via [`Fifo::drain`], decide per-item whether to re-enqueue,
/// and push survivors back.
#[derive(Default)]
pub struct Fifo(VecDeque<Key>);

impl Fifo {
	pub fn push(&mut self, key: Key, already_queued: &mut bool) {
		if *already_queued {
			return;
		}
		*already_queued = true;
		self.0.push_back(key);
	}

	pub fn pop(&mut self) -> Option<Key> {
		self.0.pop_front()
	}

	pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, Key> {
		self.0.drain(..)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}
}

/// Per-worker connection state: the pool of live TCP connections, the LRU
/// used for the timeout sweep, and the FIFOs connections move through
/// between stages. UDP listeners and TCP listeners are few and fixed for
/// the worker's lifetime, so they are held directly by [`crate::worker`]
/// rather than pooled here.
pub struct Connections {
	pub tcp: Pool<TcpConn>,
	pub lru: Lru<Key, u64>,

	pub tcp_read: Fifo,
	pub tcp_write: Fifo,
	pub release: Fifo,
	pub pipeline: Fifo,
}

impl Connections {
	pub fn new(cap: usize) -> Self {
		Self {
			tcp: Pool::with_capacity(cap),
			lru: Lru::new(),
			tcp_read: Fifo::default(),
			tcp_write: Fifo::default(),
			release: Fifo::default(),
			pipeline: Fifo::default(),
		}
	}

	pub fn active(&self) -> usize {
		self.tcp.len()
	}

	pub fn is_full(&self) -> bool {
		self.tcp.is_full()
	}

	/// Inserts a freshly accepted connection, registers it in the LRU at
	/// `deadline_ns`, and returns its key, or `None` if the pool is at
	/// capacity (the caller releases with `AssignConnIdErr` in that case).
	pub fn insert(&mut self, fd: OwnedFd, client_ip: SocketAddr, local_ip: SocketAddr, sim_queries: usize, deadline_ns: u64) -> Option<Key> {
		let conn = TcpConn::new(fd, client_ip, local_ip, sim_queries);
		let key = self.tcp.insert(conn).ok()?;
		self.lru.insert(key, deadline_ns);
		Some(key)
	}

	pub fn touch(&mut self, key: Key, deadline_ns: u64) {
		self.lru.insert(key, deadline_ns);
	}

	pub fn get(&self, key: Key) -> Option<&TcpConn> {
		self.tcp.get(key)
	}

	pub fn get_mut(&mut self, key: Key) -> Option<&mut TcpConn> {
		self.tcp.get_mut(key)
	}

	pub fn enqueue_read(&mut self, key: Key) {
		if let Some(conn) = self.tcp.get_mut(key) {
			self.tcp_read.push(key, conn_membership_read(conn));
		}
	}

	pub fn enqueue_write(&mut self, key: Key) {
		if let Some(conn) = self.tcp.get_mut(key) {
			self.tcp_write.push(key, conn_membership_write(conn));
		}
	}

	pub fn enqueue_pipeline(&mut self, key: Key) {
		if let Some(conn) = self.tcp.get_mut(key) {
			self.pipeline.push(key, conn_membership_pipeline(conn));
		}
	}

	pub fn enqueue_release(&mut self, key: Key) {
		if let Some(conn) = self.tcp.get_mut(key) {
			self.release.push(key, conn_membership_release(conn));
		}
	}

	/// Walks the LRU oldest-first, moving every connection whose deadline has
	/// passed onto the release queue.
	pub fn sweep_timeouts(&mut self, now_ns: u64, limit: usize) {
		let release = &mut self.release;
		let tcp = &mut self.tcp;

		self.lru.sweep(
			limit,
			|_, &deadline| deadline <= now_ns,
			|key, _| {
				if let Some(conn) = tcp.get_mut(key) {
					release.push(key, &mut conn.membership.release);
				}
			},
		);
	}

	/// Finishes releasing `key`: unregisters from the LRU and frees the pool
	/// slot. Unregistering the fd from the readiness waiter and bumping
	/// terminal-state metrics is the caller's responsibility, since both need
	/// data (the epoll instance, the metrics struct) this type does not own.
	pub fn release(&mut self, key: Key) -> Option<TcpConn> {
		self.lru.remove(&key);
		self.tcp.remove(key)
	}
}

fn conn_membership_read(conn: &mut TcpConn) -> &mut bool {
	&mut conn.membership.read
}

fn conn_membership_write(conn: &mut TcpConn) -> &mut bool {
	&mut conn.membership.write
}

fn conn_membership_pipeline(conn: &mut TcpConn) -> &mut bool {
	&mut conn.membership.pipeline
}

fn conn_membership_release(conn: &mut TcpConn) -> &mut bool {
	&mut conn.membership.release
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_addr() -> SocketAddr {
		SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), 5353)
	}

	fn dummy_fd() -> OwnedFd {
		let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
		a.into()
	}

	#[test]
	fn insert_registers_in_both_pool_and_lru() {
		let mut conns = Connections::new(4);
		let key = conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 100).unwrap();

		assert!(conns.get(key).is_some());
		assert_eq!(conns.lru.get(&key), Some(&100));
	}

	#[test]
	fn enqueue_read_is_idempotent() {
		let mut conns = Connections::new(4);
		let key = conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 100).unwrap();

		conns.enqueue_read(key);
		conns.enqueue_read(key);

		assert_eq!(conns.tcp_read.len(), 1);
	}

	#[test]
	fn sweep_timeouts_moves_expired_entries_to_release() {
		let mut conns = Connections::new(4);
		let key = conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 50).unwrap();

		conns.sweep_timeouts(100, 10);

		assert_eq!(conns.release.pop(), Some(key));
	}

	#[test]
	fn release_removes_from_pool_and_lru() {
		let mut conns = Connections::new(4);
		let key = conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 100).unwrap();

		assert!(conns.release(key).is_some());
		assert!(conns.get(key).is_none());
		assert_eq!(conns.lru.get(&key), None);
	}

	#[test]
	fn pool_rejects_past_capacity() {
		let mut conns = Connections::new(1);
		conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 0).unwrap();

		assert!(conns.insert(dummy_fd(), dummy_addr(), dummy_addr(), 3, 0).is_none());
	}
}
