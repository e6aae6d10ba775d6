//! The vector-loop: one OS thread's entire view of the world. Shared-nothing
//! with every other worker; the only cross-thread contact points are the two
//! control channels and the atomic [`crate::metrics::Metrics`] counters.

use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::warn;

use collections::pool::Key;
use runtime::epoll::Epoll;
use runtime::time::{monotonic_now_ns, unix_now_ns};
use utils::sockaddr::SocketAddr;

use crate::channel::{AppLogMessage, AppLogSender, FlipReply, LogBody, ResourceAck, WorkerQueryLogEndpoint, WorkerResourceEndpoint};
use crate::config::Config;
use crate::conn::{Connections, TcpState, Token};
use crate::metrics::Metrics;
use crate::query::{end_code, Protocol, Query};
use crate::querylog::{self, WorkerLog};
use crate::sock::{self, Family};

/// Idle iterations before stepping down to the next, longer sleep tier.
const IDLE_TIER: u32 = 8;
/// Ceiling on the idle-backoff sleep, regardless of tier.
const MAX_IDLE_SLEEP_US: u64 = 10_000;
/// Connections swept for timeout per iteration; bounds sweep latency the
/// same way the accept budget bounds accept latency.
const TIMEOUT_SWEEP_LIMIT: usize = 64;
/// Bytes read off a TCP socket per `read_tcp` call.
const TCP_READ_CHUNK: usize = 4096;

struct UdpListener {
	fd: OwnedFd,
	family: Family,
	local_port: u16,
	vector: Vec<Query>,
	filled: usize,
}

/// Everything one worker thread owns. Built once at startup and then never
/// touched by any other thread.
pub struct Worker {
	id: usize,
	config: Arc<Config>,
	metrics: Arc<Metrics>,

	/// The currently adopted snapshot of each configured resource, installed
	/// by [`Worker::channel_intake`] and otherwise read-only on the hot path.
	resources: Vec<Arc<Vec<u8>>>,

	udp_listeners: Vec<UdpListener>,
	tcp_listeners: Vec<OwnedFd>,
	conns: Connections,

	epoll_udp: Epoll,
	epoll_tcp: Epoll,

	resource_chan: WorkerResourceEndpoint,
	querylog_chan: WorkerQueryLogEndpoint,
	querylog: WorkerLog,
	applog: AppLogSender,

	/// TCP connections carried from Stage 6/7 (parse/resolve) into Stage 8/10
	/// (pack/write) within one iteration.
	pending_pipeline: Vec<Key>,

	idle_count: u32,
}

impl Worker {
	pub fn new(id: usize, config: Arc<Config>, metrics: Arc<Metrics>, resource_chan: WorkerResourceEndpoint, querylog_chan: WorkerQueryLogEndpoint, applog: AppLogSender) -> std::io::Result<Self> {
		let mut udp_listeners = Vec::new();
		let mut tcp_listeners = Vec::new();

		let epoll_udp = Epoll::new(config.epoll_num_events_udp)?;
		let epoll_tcp = Epoll::new(config.epoll_num_events_tcp)?;

		if config.udp_enable {
			for family in [Family::V4, Family::V6] {
				let fd = sock::udp_listener(family, config.udp_listener_port, config.udp_socket_recvbuff_size, config.udp_socket_sendbuff_size)?;
				let local_port = sock::getsockname(fd.as_raw_fd())?.port;

				let token = Token::UdpListener(udp_listeners.len()).pack();
				epoll_udp.register_read(fd.as_raw_fd(), token)?;

				let vector = (0..config.udp_conn_vector_len).map(|_| Query::new(Protocol::Udp)).collect();
				udp_listeners.push(UdpListener { fd, family, local_port, vector, filled: 0 });
			}
		}

		if config.tcp_enable {
			for family in [Family::V4, Family::V6] {
				let fd = sock::tcp_listener(family, config.tcp_listener_port, config.tcp_listener_pending_conns_max)?;
				let token = Token::TcpListener(tcp_listeners.len()).pack();
				epoll_tcp.register_read(fd.as_raw_fd(), token)?;
				tcp_listeners.push(fd);
			}
		}

		let resources = config.resources.iter().map(|_| Arc::new(Vec::new())).collect();

		Ok(Self {
			id,
			config: config.clone(),
			metrics,
			resources,
			udp_listeners,
			tcp_listeners,
			conns: Connections::new(config.tcp_conns_per_vl_max),
			epoll_udp,
			epoll_tcp,
			resource_chan,
			querylog_chan,
			querylog: WorkerLog::new(config.query_log_buffer_size),
			applog,
			pending_pipeline: Vec::new(),
			idle_count: 0,
		})
	}

	fn log_id(&self, id: u32, fatal: bool) {
		self.applog.try_send(AppLogMessage { body: LogBody::Id(id), fatal }).ok();
	}

	/// Runs the vector-loop until `shutdown` is observed, checked at the top
	/// of every iteration.
	pub fn run(&mut self, shutdown: &AtomicBool) {
		self.log_id(crate::channel::message_id::WORKER_STARTED, false);

		while !runtime::shutdown::requested(shutdown) {
			let mut busy = false;

			busy |= self.channel_intake();
			busy |= self.readiness();
			self.udp_read();
			self.tcp_accept();
			self.tcp_read();
			self.resolve_stage();
			self.pack_stage();
			busy |= self.udp_write();
			busy |= self.tcp_write();
			self.drain_udp_log_queue();

			let now = monotonic_now_ns();
			self.conns.sweep_timeouts(now, TIMEOUT_SWEEP_LIMIT);
			self.release_pending();

			self.idle_backoff(busy);
		}
	}

	// ---- Stage 1: channel intake ------------------------------------------

	fn channel_intake(&mut self) -> bool {
		let mut busy = false;

		if let Some(update) = self.resource_chan.try_recv() {
			if let Some(slot) = self.resources.get_mut(update.index) {
				*slot = update.data;
				self.resource_chan.try_send(ResourceAck { index: update.index }).ok();
			} else {
				self.log_id(crate::channel::message_id::RESOURCE_RELOAD_FAILED, true);
			}
			busy = true;
		}

		if self.querylog_chan.try_recv().is_some() {
			let bytes = self.querylog.flip();
			self.querylog_chan.try_send(FlipReply { bytes }).ok();
			busy = true;
		}

		busy
	}

	// ---- Stage 2: readiness -------------------------------------------------
	//
	// UDP listeners and TCP listeners are re-polled unconditionally every
	// iteration in Stages 3/4 regardless of what fires here (cheap,
	// nonblocking syscalls that return immediately when idle), so this stage
	// only needs to turn per-connection TCP events into FIFO membership.
	// `wait()`'s nonempty-ness still drives the idle-backoff signal.

	fn readiness(&mut self) -> bool {
		let mut busy = false;

		if let Ok(events) = self.epoll_udp.wait() {
			busy |= !events.is_empty();
		}

		if let Ok(events) = self.epoll_tcp.wait() {
			busy |= !events.is_empty();

			for event in events {
				if let Token::TcpConn(key) = Token::unpack(event.token) {
					if event.readable {
						self.conns.enqueue_read(key);
					}
					if event.writable {
						self.conns.enqueue_write(key);
					}
				}
			}
		}

		busy
	}

	// ---- Stage 3: UDP read + parse -----------------------------------------

	fn udp_read(&mut self) {
		for listener in &mut self.udp_listeners {
			let wildcard = match listener.family {
				Family::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
				Family::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
			};

			listener.filled = 0;

			for slot in &mut listener.vector {
				slot.reset();
				slot.request.resize(wire::PACKETSZ + 1, 0);
			}

			let mut bufs: Vec<&mut [u8]> = listener.vector.iter_mut().map(|slot| slot.request.as_mut_slice()).collect();

			let datagrams = match sock::recv_udp_batch(listener.fd.as_raw_fd(), &mut bufs, wildcard) {
				Ok(datagrams) => datagrams,
				Err(err) => {
					warn!("udp read: {err}");
					continue;
				}
			};

			for (i, dgram) in datagrams.iter().enumerate() {
				let slot = &mut listener.vector[i];
				slot.client_ip = dgram.client;
				slot.local_ip = SocketAddr::new(dgram.local, listener.local_port);
				slot.recv_time_ns = unix_now_ns();

				if dgram.len > wire::PACKETSZ {
					slot.request.clear();
					slot.end_code = end_code::TOO_LARGE;
				} else {
					let mut raw = std::mem::take(&mut slot.request);
					raw.truncate(dgram.len);
					slot.parse(&raw);
				}
			}

			listener.filled = datagrams.len();
		}
	}

	// ---- Stage 4: TCP accept ------------------------------------------------

	fn tcp_accept(&mut self) {
		let budget = self.config.tcp_listener_max_accept_new_conn.min(self.config.tcp_conns_per_vl_max.saturating_sub(self.conns.active()));

		if budget == 0 || self.tcp_listeners.is_empty() {
			return;
		}

		for i in 0..self.tcp_listeners.len() {
			let raw_fd = self.tcp_listeners[i].as_raw_fd();

			let outcome = match sock::accept_burst(raw_fd, budget) {
				Ok(outcome) => outcome,
				Err(err) => {
					warn!("tcp accept: {err}");
					continue;
				}
			};

			self.metrics.tcp.unknown_client_ip_family.add(outcome.unknown_client_family as u64);
			self.metrics.tcp.unknown_local_ip_family.add(outcome.unknown_local_family as u64);

			for conn in outcome.accepted {
				self.metrics.tcp.connections.incr();

				if sock::set_tcp_buffers(conn.fd.as_raw_fd(), self.config.tcp_conn_socket_recvbuff_size, self.config.tcp_conn_socket_sendbuff_size).is_err() {
					self.metrics.tcp.getsockname_err.incr();
					continue;
				}

				let deadline = monotonic_now_ns() + self.config.tcp_query_recv_timeout_ms * 1_000_000;
				let sim = self.config.tcp_conn_simultaneous_queries_count as usize;

				match self.conns.insert(conn.fd, conn.client, conn.local, sim, deadline) {
					Some(key) => {
						if let Some(c) = self.conns.get_mut(key) {
							c.state = TcpState::WaitForQueryData;
						}
						let conn_fd = self.conns.get(key).expect("just inserted").raw_fd();
						if self.epoll_tcp.register_read(conn_fd, Token::TcpConn(key).pack()).is_ok() {
							self.conns.enqueue_read(key);
						}
					}
					None => {
						self.metrics.tcp.record_terminal(TcpState::AssignConnIdErr, true, 0);
					}
				}
			}
		}
	}

	// ---- Stage 5/6: TCP read + parse ---------------------------------------

	fn tcp_read(&mut self) {
		let keys: Vec<Key> = self.conns.tcp_read.drain().collect();

		for key in keys {
			self.tcp_read_one(key);
		}
	}

	/// Reads one chunk and frames as many complete `len(2)|message(len)`
	/// queries as are present up to `tcp_conn_simultaneous_queries_count`,
	/// parsing each directly into the connection's own fixed query pool
	/// (mirroring [`UdpListener::vector`]) rather than allocating a fresh
	/// [`Query`] per frame.
	fn tcp_read_one(&mut self, key: Key) {
		let sim = self.config.tcp_conn_simultaneous_queries_count as usize;
		let keepalive_ns = self.config.tcp_keepalive_ms * 1_000_000;
		let recv_timeout_ns = self.config.tcp_query_recv_timeout_ms * 1_000_000;

		let Some(conn) = self.conns.get_mut(key) else { return };
		let start = conn.read_buffer.len();
		conn.read_buffer.resize(start + TCP_READ_CHUNK, 0);
		let raw_fd = conn.raw_fd();

		match sock::read_tcp(raw_fd, &mut conn.read_buffer[start..]) {
			Ok(0) => {
				conn.read_buffer.truncate(start);
				conn.state = TcpState::ClosedForRead;
				self.conns.enqueue_release(key);
				return;
			}
			Ok(n) => {
				conn.read_buffer.truncate(start + n);
			}
			Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
				conn.read_buffer.truncate(start);
			}
			Err(_) => {
				conn.read_buffer.truncate(start);
				conn.state = TcpState::ReadErr;
				self.conns.enqueue_release(key);
				return;
			}
		}

		let mut consumed = 0;
		let mut framed_any = false;
		let mut oversize = false;

		loop {
			let conn = self.conns.get_mut(key).expect("key valid for the duration of this call");
			if conn.query_count >= sim {
				break;
			}

			let buf = &conn.read_buffer[consumed..];
			if buf.len() < 2 {
				break;
			}

			let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
			if len > wire::PACKETSZ {
				oversize = true;
				break;
			}
			if buf.len() < 2 + len {
				break;
			}

			let frame_start = consumed + 2;
			let frame_end = frame_start + len;
			let idx = conn.query_count;
			let client_ip = conn.client_ip;
			let local_ip = conn.local_ip;
			let recv_time_ns = unix_now_ns();

			conn.queries[idx].reset();
			conn.queries[idx].client_ip = client_ip;
			conn.queries[idx].local_ip = local_ip;
			conn.queries[idx].recv_time_ns = recv_time_ns;
			conn.queries[idx].parse(&conn.read_buffer[frame_start..frame_end]);

			conn.query_count += 1;
			conn.queries_seen += 1;

			consumed = frame_end;
			framed_any = true;
		}

		if oversize {
			if let Some(conn) = self.conns.get_mut(key) {
				conn.state = TcpState::QuerySizeTooLarge;
			}
			self.conns.enqueue_release(key);
			return;
		}

		let Some(conn) = self.conns.get_mut(key) else { return };

		if consumed > 0 {
			conn.read_buffer.drain(..consumed);
		}

		if framed_any {
			self.metrics.tcp.queries.incr();
			conn.state = TcpState::Parsing;
			self.conns.enqueue_pipeline(key);
		} else {
			let (state, deadline) = if conn.read_buffer.is_empty() { (TcpState::WaitForQuery, monotonic_now_ns() + keepalive_ns) } else { (TcpState::WaitForQueryData, monotonic_now_ns() + recv_timeout_ns) };
			conn.state = state;
			self.conns.touch(key, deadline);
		}
	}

	// ---- Stage 7: resolve ----------------------------------------------------

	fn resolve_stage(&mut self) {
		for listener in &mut self.udp_listeners {
			for slot in listener.vector.iter_mut().take(listener.filled) {
				self.metrics.dns.queries.incr();
				self.metrics.udp.queries.incr();

				if slot.end_code == end_code::IN_FLIGHT {
					self.metrics.record_qtype(slot.q_type);
					crate::resolve::resolve(slot);
				}
			}
		}

		let keys: Vec<Key> = self.conns.pipeline.drain().collect();

		for &key in &keys {
			if let Some(conn) = self.conns.get_mut(key) {
				let count = conn.query_count;
				for q in &mut conn.queries[..count] {
					self.metrics.dns.queries.incr();
					if q.end_code == end_code::IN_FLIGHT {
						crate::resolve::resolve(q);
					}
				}
				conn.state = TcpState::Resolving;
			}
		}

		self.pending_pipeline = keys;
	}

	// ---- Stage 8: pack ---------------------------------------------------------

	fn pack_stage(&mut self) {
		for listener in &mut self.udp_listeners {
			for slot in listener.vector.iter_mut().take(listener.filled) {
				Self::record_end_code(&self.metrics, slot.end_code);
				if end_code::sends_response(slot.end_code) {
					slot.pack();
				}
			}
		}

		for &key in &self.pending_pipeline {
			if let Some(conn) = self.conns.get_mut(key) {
				let count = conn.query_count;
				for q in &mut conn.queries[..count] {
					if end_code::sends_response(q.end_code) {
						q.pack();
					}
				}
				conn.state = TcpState::Packing;
			}
		}
	}

	fn record_end_code(metrics: &Metrics, code: i32) {
		match code {
			end_code::SHORT_HEADER => metrics.dns.rcode_shortheader.incr(),
			end_code::TOO_LARGE => metrics.dns.rcode_toolarge.incr(),
			end_code::BADVERS => metrics.dns.rcode_badversion.incr(),
			code if code >= 0 => metrics.record_rcode((code % 16) as u8),
			_ => {}
		}
	}

	// ---- Stage 9: UDP write -----------------------------------------------------

	fn udp_write(&mut self) -> bool {
		let mut busy = false;

		for listener in &mut self.udp_listeners {
			let indices: Vec<usize> = listener.vector.iter().take(listener.filled).enumerate().filter(|(_, slot)| end_code::sends_response(slot.end_code)).map(|(i, _)| i).collect();

			if indices.is_empty() {
				continue;
			}

			let msgs: Vec<(&[u8], SocketAddr, IpAddr)> = indices.iter().map(|&i| { let slot = &listener.vector[i]; (slot.response.as_slice(), slot.client_ip, slot.local_ip.addr) }).collect();

			match sock::send_udp_batch(listener.fd.as_raw_fd(), &msgs) {
				Ok(sent) => {
					if sent > 0 {
						busy = true;
					}
					let now = unix_now_ns();
					for &i in indices.iter().take(sent) {
						listener.vector[i].send_time_ns = Some(now);
					}
				}
				Err(err) => warn!("udp write: {err}"),
			}
		}

		busy
	}

	// ---- Stage 10: TCP write -----------------------------------------------------

	fn tcp_write(&mut self) -> bool {
		let keys = std::mem::take(&mut self.pending_pipeline);
		let mut busy = false;

		for key in keys {
			if self.tcp_write_one(key) {
				busy = true;
			}
		}

		busy
	}

	fn tcp_write_one(&mut self, key: Key) -> bool {
		let mut wrote = false;
		let send_timeout_ns = self.config.tcp_query_send_timeout_ms * 1_000_000;

		loop {
			let Some(conn) = self.conns.get_mut(key) else { return wrote };

			if conn.write_index >= conn.query_count {
				break;
			}

			if !end_code::sends_response(conn.queries[conn.write_index].end_code) {
				conn.write_index += 1;
				conn.byte_index = 0;
				continue;
			}

			let raw_fd = conn.raw_fd();
			let byte_index = conn.byte_index;
			let write_index = conn.write_index;
			let remaining = &conn.queries[write_index].response[byte_index..];

			match sock::write_tcp(raw_fd, remaining) {
				Ok(0) => {
					conn.state = TcpState::ClosedForWrite;
					self.conns.enqueue_release(key);
					return wrote;
				}
				Ok(n) if n == remaining.len() => {
					conn.queries[write_index].send_time_ns = Some(unix_now_ns());
					conn.write_index += 1;
					conn.byte_index = 0;
					wrote = true;
				}
				Ok(n) => {
					conn.byte_index += n;
					wrote = true;
				}
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
					conn.state = TcpState::Writing;
					let deadline = monotonic_now_ns() + send_timeout_ns;
					self.conns.touch(key, deadline);
					self.conns.enqueue_write(key);
					return wrote;
				}
				Err(_) => {
					conn.state = TcpState::WriteErr;
					self.conns.enqueue_release(key);
					return wrote;
				}
			}
		}

		self.finish_connection(key);
		wrote
	}

	fn finish_connection(&mut self, key: Key) {
		let keepalive_ns = self.config.tcp_keepalive_ms * 1_000_000;
		let recv_timeout_ns = self.config.tcp_query_recv_timeout_ms * 1_000_000;

		let Some(conn) = self.conns.get_mut(key) else { return };
		let state = conn.state;
		let count = conn.query_count;

		for q in &conn.queries[..count] {
			if let Some(line) = querylog::format_record(q) {
				self.querylog.append(&line);
			}
		}
		for q in &mut conn.queries[..count] {
			q.reset();
		}
		conn.query_count = 0;
		conn.write_index = 0;
		conn.byte_index = 0;

		if matches!(state, TcpState::ClosedForRead | TcpState::ReadErr | TcpState::WriteErr | TcpState::ClosedForWrite) {
			self.conns.enqueue_release(key);
			return;
		}

		let (next_state, deadline) = if conn.read_buffer.is_empty() { (TcpState::WaitForQuery, monotonic_now_ns() + keepalive_ns) } else { (TcpState::WaitForQueryData, monotonic_now_ns() + recv_timeout_ns) };
		conn.state = next_state;
		self.conns.touch(key, deadline);
		self.conns.enqueue_read(key);
	}

	// ---- Post-pipeline: UDP log queue (TCP already logged in finish_connection) --

	fn drain_udp_log_queue(&mut self) {
		for listener in &mut self.udp_listeners {
			for slot in listener.vector.iter_mut().take(listener.filled) {
				if let Some(line) = querylog::format_record(slot) {
					self.querylog.append(&line);
				}
			}
		}
	}

	// ---- Release -----------------------------------------------------------------

	fn release_pending(&mut self) {
		let keys: Vec<Key> = self.conns.release.drain().collect();

		for key in keys {
			if let Some(conn) = self.conns.release(key) {
				self.epoll_tcp.unregister(conn.raw_fd()).ok();
				self.metrics.tcp.record_terminal(conn.state, conn.read_buffer.is_empty(), conn.queries_seen);
			}
		}
	}

	// ---- Idle backoff --------------------------------------------------------------

	fn idle_backoff(&mut self, busy: bool) {
		if busy {
			self.idle_count = 0;
			return;
		}

		self.idle_count += 1;

		let sleep_us = if self.idle_count <= IDLE_TIER {
			self.config.loop_slowdown_one_us
		} else if self.idle_count <= IDLE_TIER * 2 {
			self.config.loop_slowdown_two_us
		} else {
			self.config.loop_slowdown_three_us
		}
		.min(MAX_IDLE_SLEEP_US);

		std::thread::sleep(std::time::Duration::from_micros(sleep_us));
	}

	pub fn id(&self) -> usize {
		self.id
	}
}
