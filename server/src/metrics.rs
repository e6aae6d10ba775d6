//! Process-wide atomic counters. Plain atomics rather than per-thread shards:
//! contention is negligible next to the cost of the syscalls each counter bump
//! sits beside, so there is nothing to amortize by sharding.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::conn::TcpState;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
	pub fn incr(&self) {
		self.0.fetch_add(1, Ordering::Relaxed);
	}

	pub fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::Relaxed);
	}

	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

#[derive(Default)]
pub struct TcpMetrics {
	pub connections: Counter,
	pub queries: Counter,
	pub unknown_client_ip_family: Counter,
	pub getsockname_err: Counter,
	pub unknown_local_ip_family: Counter,
	pub conn_id_unavailable: Counter,
	pub query_len_toolarge: Counter,
	pub query_recv_timeout: Counter,
	pub keepalive_timeout: Counter,
	pub closed_no_query: Counter,
	pub closed_partial_query: Counter,
	pub sock_read_err: Counter,
	pub sock_write_err: Counter,
	pub sock_write_timeout: Counter,
	pub sock_closed_for_write: Counter,
}

impl TcpMetrics {
	/// Bumps the single counter `state` maps to, at the moment a connection
	/// is actually released — not when the underlying condition was first
	/// observed, since a connection can sit in a wait state for a while
	/// before its timeout fires. `read_buffer_empty`/`queries_seen` only
	/// matter for `ClosedForRead`, which splits on whether any bytes or
	/// queries ever arrived.
	pub fn record_terminal(&self, state: TcpState, read_buffer_empty: bool, queries_seen: u64) {
		match state {
			TcpState::AssignConnIdErr => self.conn_id_unavailable.incr(),
			TcpState::QuerySizeTooLarge => self.query_len_toolarge.incr(),
			TcpState::ClosedForRead => {
				if !read_buffer_empty {
					self.closed_partial_query.incr();
				} else if queries_seen == 0 {
					self.closed_no_query.incr();
				}
			}
			TcpState::ClosedForWrite => self.sock_closed_for_write.incr(),
			TcpState::ReadErr => self.sock_read_err.incr(),
			TcpState::WaitForQuery => self.keepalive_timeout.incr(),
			TcpState::WaitForQueryData => self.query_recv_timeout.incr(),
			TcpState::Writing => self.sock_write_timeout.incr(),
			TcpState::WriteErr => self.sock_write_err.incr(),
			_ => {}
		}
	}
}

#[derive(Default)]
pub struct UdpMetrics {
	pub queries: Counter,
}

#[derive(Default)]
pub struct DnsMetrics {
	pub queries: Counter,
	pub rcode_noerror: Counter,
	pub rcode_formerr: Counter,
	pub rcode_servfail: Counter,
	pub rcode_nxdomain: Counter,
	pub rcode_notimpl: Counter,
	pub rcode_refused: Counter,
	pub rcode_shortheader: Counter,
	pub rcode_toolarge: Counter,
	pub rcode_badversion: Counter,
	pub type_invalid: Counter,
	pub type_a: Counter,
	pub type_aaaa: Counter,
	pub type_ns: Counter,
	pub type_unsupported: Counter,
	pub edns_present: Counter,
	pub edns_valid: Counter,
	pub edns_dobit: Counter,
	pub clientsubnet: Counter,
}

#[derive(Default)]
pub struct AppMetrics {
	pub app_log_open_error: Counter,
	pub app_log_write_error: Counter,
	pub query_log_buf_no_space: Counter,
	pub query_log_open_error: Counter,
	pub resource_reload_error: Counter,
}

#[derive(Default)]
pub struct Metrics {
	pub tcp: TcpMetrics,
	pub udp: UdpMetrics,
	pub dns: DnsMetrics,
	pub app: AppMetrics,
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_rcode(&self, rcode: u8) {
		match rcode {
			0 => self.dns.rcode_noerror.incr(),
			1 => self.dns.rcode_formerr.incr(),
			2 => self.dns.rcode_servfail.incr(),
			3 => self.dns.rcode_nxdomain.incr(),
			4 => self.dns.rcode_notimpl.incr(),
			5 => self.dns.rcode_refused.incr(),
			_ => {}
		}
	}

	pub fn record_qtype(&self, qtype: u16) {
		match qtype {
			wire::TYPE_A => self.dns.type_a.incr(),
			wire::TYPE_AAAA => self.dns.type_aaaa.incr(),
			wire::TYPE_NS => self.dns.type_ns.incr(),
			_ => self.dns.type_unsupported.incr(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_start_at_zero_and_increment() {
		let metrics = Metrics::new();
		assert_eq!(metrics.tcp.connections.get(), 0);

		metrics.tcp.connections.incr();
		metrics.tcp.connections.incr();
		assert_eq!(metrics.tcp.connections.get(), 2);
	}

	#[test]
	fn record_rcode_routes_to_the_matching_counter() {
		let metrics = Metrics::new();
		metrics.record_rcode(2);
		assert_eq!(metrics.dns.rcode_servfail.get(), 1);
		assert_eq!(metrics.dns.rcode_noerror.get(), 0);
	}
}
