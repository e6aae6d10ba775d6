//! Command-line configuration: `--flag=value` parsing with bounds checking, no
//! external argument-parsing crate, mirroring the reference implementation's
//! hand-rolled, table-driven validation.

use std::fmt;

macro_rules! bounded_u {
	($ty:ty, $name:ident, $min:expr, $max:expr) => {
		fn $name(raw: &str) -> Result<$ty, String> {
			let value: $ty = raw.parse().map_err(|_| format!("not an integer: {raw:?}"))?;

			if (value as i64) < $min || (value as i64) > $max {
				return Err(format!("out of range [{}, {}]: {}", $min, $max, value));
			}

			Ok(value)
		}
	};
}

bounded_u!(u16, port, TCP_UDP_PORT_MIN, TCP_UDP_PORT_MAX);
bounded_u!(usize, pending_conns, TCP_LIST_PENDING_CONNS_MAX_MIN, TCP_LIST_PENDING_CONNS_MAX_MAX);
bounded_u!(usize, accept_burst, TCP_LIST_MAX_ACCEPT_NEW_CONN_MIN, TCP_LIST_MAX_ACCEPT_NEW_CONN_MAX);
bounded_u!(usize, tcp_recvbuff, TCP_CONN_SO_RECVBUFF_MIN, TCP_CONN_SO_RECVBUFF_MAX);
bounded_u!(usize, tcp_sendbuff, TCP_CONN_SO_SENDBUFF_MIN, TCP_CONN_SO_SENDBUFF_MAX);
bounded_u!(u8, sim_queries, TCP_CONN_SIM_QUERY_COUNT_MIN, TCP_CONN_SIM_QUERY_COUNT_MAX);
bounded_u!(usize, udp_vector_len, UDP_CONN_VECTOR_LEN_MIN, UDP_CONN_VECTOR_LEN_MAX);
bounded_u!(usize, udp_recvbuff, UDP_CONN_SO_RECVBUFF_MIN, UDP_CONN_SO_RECVBUFF_MAX);
bounded_u!(usize, udp_sendbuff, UDP_CONN_SO_SENDBUFF_MIN, UDP_CONN_SO_SENDBUFF_MAX);
bounded_u!(u64, keepalive, TCP_KEEPALIVE_MIN, TCP_KEEPALIVE_MAX);
bounded_u!(usize, epoll_events, EPOLL_NUM_EVENTS_MIN, EPOLL_NUM_EVENTS_MAX);
bounded_u!(usize, thread_count, PROCESS_THREAD_COUNT_MIN, PROCESS_THREAD_COUNT_MAX);
bounded_u!(u64, slowdown, VL_SLOWDOWN_MIN, VL_SLOWDOWN_MAX);
bounded_u!(usize, conn_cap, 1, TCP_LIST_PENDING_CONNS_MAX_MAX as i64 * 100);

const TCP_UDP_PORT_MIN: i64 = 1;
const TCP_UDP_PORT_MAX: i64 = 65535;
const TCP_LIST_PENDING_CONNS_MAX_MIN: i64 = 1;
const TCP_LIST_PENDING_CONNS_MAX_MAX: i64 = 0xffff;
const TCP_LIST_MAX_ACCEPT_NEW_CONN_MIN: i64 = 1;
const TCP_LIST_MAX_ACCEPT_NEW_CONN_MAX: i64 = 1024;
const TCP_CONN_SO_RECVBUFF_MIN: i64 = 514;
const TCP_CONN_SO_RECVBUFF_MAX: i64 = 0xffff;
const TCP_CONN_SO_SENDBUFF_MIN: i64 = 514;
const TCP_CONN_SO_SENDBUFF_MAX: i64 = 0xfffff;
const TCP_CONN_SIM_QUERY_COUNT_MIN: i64 = 1;
const TCP_CONN_SIM_QUERY_COUNT_MAX: i64 = 0xff;
const UDP_CONN_VECTOR_LEN_MIN: i64 = 1;
const UDP_CONN_VECTOR_LEN_MAX: i64 = 0xffff;
const UDP_CONN_SO_RECVBUFF_MIN: i64 = 518;
const UDP_CONN_SO_RECVBUFF_MAX: i64 = 0xffffff;
const UDP_CONN_SO_SENDBUFF_MIN: i64 = 512;
const UDP_CONN_SO_SENDBUFF_MAX: i64 = 0xffffff;
const TCP_KEEPALIVE_MIN: i64 = 1000;
const TCP_KEEPALIVE_MAX: i64 = 600000;
const EPOLL_NUM_EVENTS_MIN: i64 = 3;
const EPOLL_NUM_EVENTS_MAX: i64 = 1024;
const PROCESS_THREAD_COUNT_MIN: i64 = 1;
const PROCESS_THREAD_COUNT_MAX: i64 = 1024;
const VL_SLOWDOWN_MIN: i64 = 1;
const VL_SLOWDOWN_MAX: i64 = 10000;

/// One demonstration resource, matching `RESOURCE_COUNT = 1` in the reference
/// implementation. The reloader (see [`crate::resource`]) is written generically
/// over a slice so a future caller could supply more.
#[derive(Clone, Debug)]
pub struct ResourceConfig {
	pub name: String,
	pub filepath: String,
	pub update_freq_secs: u64,
}

/// Every tunable the server reads once at startup and shares by reference
/// with every worker and auxiliary thread thereafter.
#[derive(Clone, Debug)]
pub struct Config {
	pub udp_enable: bool,
	pub udp_listener_port: u16,
	pub udp_socket_recvbuff_size: usize,
	pub udp_socket_sendbuff_size: usize,
	pub udp_conn_vector_len: usize,

	pub tcp_enable: bool,
	pub tcp_listener_pending_conns_max: usize,
	pub tcp_listener_port: u16,
	pub tcp_conns_per_vl_max: usize,
	pub tcp_listener_max_accept_new_conn: usize,
	pub tcp_conn_socket_recvbuff_size: usize,
	pub tcp_conn_socket_sendbuff_size: usize,
	pub tcp_conn_simultaneous_queries_count: u8,
	pub tcp_keepalive_ms: u64,
	pub tcp_query_recv_timeout_ms: u64,
	pub tcp_query_send_timeout_ms: u64,

	pub epoll_num_events_udp: usize,
	pub epoll_num_events_tcp: usize,

	pub process_thread_count: usize,
	/// 1-indexed CPU numbers, one per worker index. Workers beyond the mask
	/// length are left unpinned.
	pub process_thread_masks: Vec<usize>,

	pub loop_slowdown_one_us: u64,
	pub loop_slowdown_two_us: u64,
	pub loop_slowdown_three_us: u64,

	pub app_log_name: String,
	pub app_log_path: String,

	pub query_log_buffer_size: usize,
	pub query_log_base_name: String,
	pub query_log_path: String,
	pub query_log_rotate_size: u64,

	pub resources: Vec<ResourceConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			udp_enable: true,
			udp_listener_port: 53,
			udp_socket_recvbuff_size: 0xfffff,
			udp_socket_sendbuff_size: 0xfffff,
			udp_conn_vector_len: 8,

			tcp_enable: true,
			tcp_listener_pending_conns_max: 1024,
			tcp_listener_port: 53,
			tcp_conns_per_vl_max: 100000,
			tcp_listener_max_accept_new_conn: 8,
			tcp_conn_socket_recvbuff_size: 0x800,
			tcp_conn_socket_sendbuff_size: 0x3000,
			tcp_conn_simultaneous_queries_count: 3,
			tcp_keepalive_ms: 10000,
			tcp_query_recv_timeout_ms: 2000,
			tcp_query_send_timeout_ms: 2000,

			epoll_num_events_udp: 8,
			epoll_num_events_tcp: 8,

			process_thread_count: 1,
			process_thread_masks: Vec::new(),

			loop_slowdown_one_us: 1,
			loop_slowdown_two_us: 50,
			loop_slowdown_three_us: 100,

			app_log_name: "dnsd.log".into(),
			app_log_path: ".".into(),

			query_log_buffer_size: 6553500,
			query_log_base_name: "dns_query_log".into(),
			query_log_path: "logs".into(),
			query_log_rotate_size: 50000000,

			resources: vec![ResourceConfig { name: "Resource_1".into(), filepath: "resource1.txt".into(), update_freq_secs: 5 }],
		}
	}
}

/// A startup failure: an unrecognized flag, a malformed or out-of-range value, or
/// a flag supplied twice. Carries its own `Display` so callers can print it
/// prefixed with the program name and exit 1.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

fn parse_bool(raw: &str) -> Result<bool, String> {
	match raw {
		"true" => Ok(true),
		"false" => Ok(false),
		other => Err(format!("expected true/false, got {other:?}")),
	}
}

fn parse_masks(raw: &str) -> Result<Vec<usize>, String> {
	raw.split(',')
		.map(|s| {
			let cpu: usize = s.trim().parse().map_err(|_| format!("not an integer: {s:?}"))?;

			if cpu == 0 {
				return Err("process_thread_masks entries are 1-indexed".into());
			}

			Ok(cpu - 1)
		})
		.collect()
}

/// The result of handling `--help`: the usage text was already printed to
/// stdout and the process should exit 0 without constructing a [`Config`].
#[derive(Debug)]
pub struct HelpRequested;

/// Describes one flag for the purposes of `--help` output.
struct FlagDoc {
	name: &'static str,
	default: String,
	bounds: Option<String>,
}

fn flag_docs(defaults: &Config) -> Vec<FlagDoc> {
	vec![
		FlagDoc { name: "udp_enable", default: defaults.udp_enable.to_string(), bounds: None },
		FlagDoc { name: "udp_listener_port", default: defaults.udp_listener_port.to_string(), bounds: Some("[1, 65535]".into()) },
		FlagDoc { name: "udp_socket_recvbuff_size", default: defaults.udp_socket_recvbuff_size.to_string(), bounds: Some("[518, 16777215]".into()) },
		FlagDoc { name: "udp_socket_sendbuff_size", default: defaults.udp_socket_sendbuff_size.to_string(), bounds: Some("[512, 16777215]".into()) },
		FlagDoc { name: "udp_conn_vector_len", default: defaults.udp_conn_vector_len.to_string(), bounds: Some("[1, 65535]".into()) },
		FlagDoc { name: "tcp_enable", default: defaults.tcp_enable.to_string(), bounds: None },
		FlagDoc { name: "tcp_listener_pending_conns_max", default: defaults.tcp_listener_pending_conns_max.to_string(), bounds: Some("[1, 65535]".into()) },
		FlagDoc { name: "tcp_listener_port", default: defaults.tcp_listener_port.to_string(), bounds: Some("[1, 65535]".into()) },
		FlagDoc { name: "tcp_conns_per_vl_max", default: defaults.tcp_conns_per_vl_max.to_string(), bounds: Some("[1, unbounded]".into()) },
		FlagDoc { name: "tcp_listener_max_accept_new_conn", default: defaults.tcp_listener_max_accept_new_conn.to_string(), bounds: Some("[1, 1024]".into()) },
		FlagDoc { name: "tcp_conn_socket_recvbuff_size", default: defaults.tcp_conn_socket_recvbuff_size.to_string(), bounds: Some("[514, 65535]".into()) },
		FlagDoc { name: "tcp_conn_socket_sendbuff_size", default: defaults.tcp_conn_socket_sendbuff_size.to_string(), bounds: Some("[514, 1048575]".into()) },
		FlagDoc { name: "tcp_conn_simultaneous_queries_count", default: defaults.tcp_conn_simultaneous_queries_count.to_string(), bounds: Some("[1, 255]".into()) },
		FlagDoc { name: "tcp_keepalive", default: defaults.tcp_keepalive_ms.to_string(), bounds: Some("[1000, 600000]".into()) },
		FlagDoc { name: "tcp_query_recv_timeout", default: defaults.tcp_query_recv_timeout_ms.to_string(), bounds: None },
		FlagDoc { name: "tcp_query_send_timeout", default: defaults.tcp_query_send_timeout_ms.to_string(), bounds: None },
		FlagDoc { name: "epoll_num_events_udp", default: defaults.epoll_num_events_udp.to_string(), bounds: Some("[3, 1024]".into()) },
		FlagDoc { name: "epoll_num_events_tcp", default: defaults.epoll_num_events_tcp.to_string(), bounds: Some("[3, 1024]".into()) },
		FlagDoc { name: "process_thread_count", default: defaults.process_thread_count.to_string(), bounds: Some("[1, 1024]".into()) },
		FlagDoc { name: "process_thread_masks", default: "(none)".into(), bounds: Some("CSV of 1-indexed CPU numbers".into()) },
		FlagDoc { name: "loop_slowdown_one", default: defaults.loop_slowdown_one_us.to_string(), bounds: Some("[1, 10000]".into()) },
		FlagDoc { name: "loop_slowdown_two", default: defaults.loop_slowdown_two_us.to_string(), bounds: Some("[1, 10000]".into()) },
		FlagDoc { name: "loop_slowdown_three", default: defaults.loop_slowdown_three_us.to_string(), bounds: Some("[1, 10000]".into()) },
		FlagDoc { name: "app_log_name", default: defaults.app_log_name.clone(), bounds: None },
		FlagDoc { name: "app_log_path", default: defaults.app_log_path.clone(), bounds: None },
		FlagDoc { name: "query_log_buffer_size", default: defaults.query_log_buffer_size.to_string(), bounds: None },
		FlagDoc { name: "query_log_base_name", default: defaults.query_log_base_name.clone(), bounds: None },
		FlagDoc { name: "query_log_path", default: defaults.query_log_path.clone(), bounds: None },
		FlagDoc { name: "query_log_rotate_size", default: defaults.query_log_rotate_size.to_string(), bounds: None },
		FlagDoc { name: "resource_1_name", default: defaults.resources[0].name.clone(), bounds: None },
		FlagDoc { name: "resource_1_filepath", default: defaults.resources[0].filepath.clone(), bounds: None },
		FlagDoc { name: "resource_1_update_freq", default: defaults.resources[0].update_freq_secs.to_string(), bounds: None },
	]
}

fn print_usage() {
	let defaults = Config::default();

	println!("Usage: dnsd [--flag=value]...");
	println!();

	for doc in flag_docs(&defaults) {
		match doc.bounds {
			Some(bounds) => println!("  --{:<40} default={:<20} bounds={}", doc.name, doc.default, bounds),
			None => println!("  --{:<40} default={}", doc.name, doc.default),
		}
	}
}

impl Config {
	/// Parses `--flag=value` arguments. `--help` short-circuits: usage is
	/// printed to stdout and `Ok(Err(HelpRequested))` is returned so the
	/// caller can exit 0 before constructing any other state.
	pub fn parse(args: impl Iterator<Item = String>) -> Result<Result<Self, HelpRequested>, ConfigError> {
		let mut seen = std::collections::HashSet::new();
		let mut cfg = Config::default();

		for arg in args {
			if arg == "--help" {
				print_usage();
				return Ok(Err(HelpRequested));
			}

			let rest = arg.strip_prefix("--").ok_or_else(|| ConfigError(format!("flags must start with --: {arg:?}")))?;
			let (name, value) = rest.split_once('=').ok_or_else(|| ConfigError(format!("expected --flag=value: {arg:?}")))?;

			if !seen.insert(name.to_string()) {
				return Err(ConfigError(format!("flag supplied more than once: {name}")));
			}

			apply(&mut cfg, name, value).map_err(|e| ConfigError(format!("--{name}: {e}")))?;
		}

		Ok(Ok(cfg))
	}
}

fn apply(cfg: &mut Config, name: &str, value: &str) -> Result<(), String> {
	match name {
		"udp_enable" => cfg.udp_enable = parse_bool(value)?,
		"udp_listener_port" => cfg.udp_listener_port = port(value)?,
		"udp_socket_recvbuff_size" => cfg.udp_socket_recvbuff_size = udp_recvbuff(value)?,
		"udp_socket_sendbuff_size" => cfg.udp_socket_sendbuff_size = udp_sendbuff(value)?,
		"udp_conn_vector_len" => cfg.udp_conn_vector_len = udp_vector_len(value)?,

		"tcp_enable" => cfg.tcp_enable = parse_bool(value)?,
		"tcp_listener_pending_conns_max" => cfg.tcp_listener_pending_conns_max = pending_conns(value)?,
		"tcp_listener_port" => cfg.tcp_listener_port = port(value)?,
		"tcp_conns_per_vl_max" => cfg.tcp_conns_per_vl_max = conn_cap(value)?,
		"tcp_listener_max_accept_new_conn" => cfg.tcp_listener_max_accept_new_conn = accept_burst(value)?,
		"tcp_conn_socket_recvbuff_size" => cfg.tcp_conn_socket_recvbuff_size = tcp_recvbuff(value)?,
		"tcp_conn_socket_sendbuff_size" => cfg.tcp_conn_socket_sendbuff_size = tcp_sendbuff(value)?,
		"tcp_conn_simultaneous_queries_count" => cfg.tcp_conn_simultaneous_queries_count = sim_queries(value)?,
		"tcp_keepalive" => cfg.tcp_keepalive_ms = keepalive(value)?,
		"tcp_query_recv_timeout" => cfg.tcp_query_recv_timeout_ms = value.parse().map_err(|_| "not an integer".to_string())?,
		"tcp_query_send_timeout" => cfg.tcp_query_send_timeout_ms = value.parse().map_err(|_| "not an integer".to_string())?,

		"epoll_num_events_udp" => cfg.epoll_num_events_udp = epoll_events(value)?,
		"epoll_num_events_tcp" => cfg.epoll_num_events_tcp = epoll_events(value)?,

		"process_thread_count" => cfg.process_thread_count = thread_count(value)?,
		"process_thread_masks" => cfg.process_thread_masks = parse_masks(value)?,

		"loop_slowdown_one" => cfg.loop_slowdown_one_us = slowdown(value)?,
		"loop_slowdown_two" => cfg.loop_slowdown_two_us = slowdown(value)?,
		"loop_slowdown_three" => cfg.loop_slowdown_three_us = slowdown(value)?,

		"app_log_name" => cfg.app_log_name = value.to_string(),
		"app_log_path" => cfg.app_log_path = value.to_string(),

		"query_log_buffer_size" => cfg.query_log_buffer_size = value.parse().map_err(|_| "not an integer".to_string())?,
		"query_log_base_name" => cfg.query_log_base_name = value.to_string(),
		"query_log_path" => cfg.query_log_path = value.to_string(),
		"query_log_rotate_size" => cfg.query_log_rotate_size = value.parse().map_err(|_| "not an integer".to_string())?,

		"resource_1_name" => cfg.resources[0].name = value.to_string(),
		"resource_1_filepath" => cfg.resources[0].filepath = value.to_string(),
		"resource_1_update_freq" => cfg.resources[0].update_freq_secs = value.parse().map_err(|_| "not an integer".to_string())?,

		other => return Err(format!("unrecognized flag: {other}")),
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(flags: &[&str]) -> impl Iterator<Item = String> {
		flags.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
	}

	#[test]
	fn defaults_round_trip_through_their_own_display() {
		let cfg = Config::parse(args(&[])).unwrap().unwrap();
		assert_eq!(cfg.udp_listener_port, 53);
		assert_eq!(cfg.process_thread_count, 1);
	}

	#[test]
	fn rejects_out_of_range_port() {
		let err = Config::parse(args(&["--udp_listener_port=70000"])).unwrap_err();
		assert!(err.0.contains("udp_listener_port"));
	}

	#[test]
	fn rejects_duplicate_flag() {
		let err = Config::parse(args(&["--tcp_enable=true", "--tcp_enable=false"])).unwrap_err();
		assert!(err.0.contains("more than once"));
	}

	#[test]
	fn rejects_unrecognized_flag() {
		let err = Config::parse(args(&["--not_a_real_flag=1"])).unwrap_err();
		assert!(err.0.contains("unrecognized"));
	}

	#[test]
	fn parses_one_indexed_thread_masks() {
		let cfg = Config::parse(args(&["--process_thread_masks=1,3,4"])).unwrap().unwrap();
		assert_eq!(cfg.process_thread_masks, vec![0, 2, 3]);
	}

	#[test]
	fn help_short_circuits_without_constructing_a_config() {
		let result = Config::parse(args(&["--help"])).unwrap();
		assert!(result.is_err());
	}
}
