//! The per-worker query-log buffer and the cross-thread writer that flips,
//! drains, and rotates it to disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::warn;
use serde::Serialize;

use crate::channel::{FlipRequest, QueryLogEndpoint};
use crate::query::{end_code, Query};

/// How long the writer waits before retrying a failed file open.
const FILE_OPEN_RETRY: Duration = Duration::from_secs(5);

/// How long the writer sleeps after a pass that flipped zero bytes from
/// every worker, so it doesn't spin polling idle workers.
const LOOP_SLOWDOWN: Duration = Duration::from_micros(500);

/// A line longer than this is dropped rather than risk splitting a buffer
/// mid-record; DNS query/response JSON lines are small, so this is a very
/// conservative ceiling.
const MAX_LINE_LEN: usize = 4096;

/// A worker's double-buffered query log, owned entirely by that worker's
/// thread. The writer thread never touches these bytes directly: it only
/// ever sees the `Arc<[u8]>` snapshot handed back across [`QueryLogEndpoint`].
pub struct WorkerLog {
	buffers: [Vec<u8>; 2],
	active: usize,
	dropped: u64,
}

impl WorkerLog {
	pub fn new(buffer_size: usize) -> Self {
		Self { buffers: [Vec::with_capacity(buffer_size), Vec::with_capacity(buffer_size)], active: 0, dropped: 0 }
	}

	fn capacity(&self) -> usize {
		self.buffers[self.active].capacity()
	}

	/// Appends one record's JSON line (with its trailing `\n`) to the active
	/// buffer, or drops it and bumps the drop counter if too little room
	/// remains. Returns whether the record was kept.
	pub fn append(&mut self, line: &str) -> bool {
		let capacity = self.capacity();
		let buf = &mut self.buffers[self.active];

		if line.len() > MAX_LINE_LEN || buf.len() + line.len() + 1 > capacity {
			self.dropped += 1;
			return false;
		}

		buf.extend_from_slice(line.as_bytes());
		buf.push(b'\n');
		true
	}

	pub fn dropped(&self) -> u64 {
		self.dropped
	}

	/// Stage 1 of the vector-loop handles `FlipRequest`: switches the active
	/// buffer and hands back the bytes that had accumulated in the one just
	/// retired, or `None` if it was empty.
	pub fn flip(&mut self) -> Option<Arc<[u8]>> {
		let retiring = self.active;
		self.active = 1 - self.active;

		if self.buffers[retiring].is_empty() {
			return None;
		}

		let bytes: Arc<[u8]> = self.buffers[retiring].clone().into();
		self.buffers[retiring].clear();
		Some(bytes)
	}
}

#[derive(Serialize)]
struct EdnsFields {
	version: u8,
	udp_size: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	subnet: Option<String>,
}

#[derive(Serialize)]
struct RequestFields {
	rd: bool,
	tc: bool,
	opcode: u8,
	#[serde(skip_serializing_if = "Option::is_none")]
	edns: Option<EdnsFields>,
	q_name: String,
	q_class: u16,
	q_type: u16,
}

#[derive(Serialize)]
struct AnswerFields {
	name: String,
	ty: u16,
	class: u16,
	ttl: u32,
	rdata: String,
}

#[derive(Serialize)]
struct ResponseFields {
	answer: Vec<AnswerFields>,
}

#[derive(Serialize)]
struct LogRecord {
	c_ip: String,
	c_port: u16,
	l_ip: String,
	l_port: u16,
	recv_time: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	send_time: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	request: Option<RequestFields>,
	#[serde(skip_serializing_if = "Option::is_none")]
	response: Option<ResponseFields>,
}

fn rfc3339_nanos(ns: u64) -> String {
	let time = SystemTime::UNIX_EPOCH + Duration::from_nanos(ns);
	humantime::format_rfc3339_nanos(time).to_string()
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds one JSON line for `q`, or `None` if this end-code should not be
/// logged at all (in-flight, or a write-side failure with nothing new to
/// report). Format-error and SERVFAIL end-codes log request-only;
/// SHORTHEADER/TOO_LARGE log only the receive timestamp.
pub fn format_record(q: &Query) -> Option<String> {
	let minimal = |request, response| LogRecord {
		c_ip: q.client_ip.addr.to_string(),
		c_port: q.client_ip.port,
		l_ip: q.local_ip.addr.to_string(),
		l_port: q.local_ip.port,
		recv_time: rfc3339_nanos(q.recv_time_ns),
		send_time: q.send_time_ns.map(rfc3339_nanos),
		request,
		response,
	};

	let record = match q.end_code {
		end_code::IN_FLIGHT => return None,
		end_code::SHORT_HEADER | end_code::TOO_LARGE => minimal(None, None),
		end_code::TC_SET | end_code::WRITE_ERR | end_code::WRITE_CLOSED => return None,
		_ => {
			let request = Some(RequestFields {
				rd: q.rd,
				tc: q.tc_request,
				opcode: q.opcode,
				edns: q.edns.present.then(|| EdnsFields { version: q.edns.version, udp_size: q.edns.udp_resp_len, subnet: q.edns.subnet.as_ref().map(|s| hex(&s.address)) }),
				q_name: q.q_name.clone(),
				q_class: q.q_class,
				q_type: q.q_type,
			});

			let response = (q.end_code == 0).then(|| ResponseFields {
				answer: q.answer.iter().take(10).map(|r| AnswerFields { name: r.name.clone(), ty: r.ty, class: r.class, ttl: r.ttl, rdata: hex(&r.rdata) }).collect(),
			});

			minimal(request, response)
		}
	};

	serde_json::to_string(&record).ok()
}

/// Per-worker writer-side state: where each worker's drained bytes land.
struct Destination {
	file: Option<File>,
	written_since_open: u64,
}

/// Runs forever, flipping every worker's buffer in turn and appending the
/// drained bytes to a rotating log file. Intended as the body of its own OS
/// thread.
pub fn run(endpoints: Vec<QueryLogEndpoint>, dir: &str, base_name: &str, rotate_size: u64, shutdown: &AtomicBool) {
	std::fs::create_dir_all(dir).ok();

	let mut dest = Destination { file: None, written_since_open: 0 };
	let mut next_retry = std::time::Instant::now();

	while !runtime::shutdown::requested(shutdown) {
		let mut wrote_any = false;

		for endpoint in &endpoints {
			if endpoint.try_send(FlipRequest).is_err() {
				continue;
			}

			let reply = loop {
				if let Some(reply) = endpoint.try_recv() {
					break reply;
				}
				if runtime::shutdown::requested(shutdown) {
					return;
				}
				std::thread::yield_now();
			};

			let Some(bytes) = reply.bytes else { continue };

			if std::time::Instant::now() < next_retry {
				continue;
			}

			if dest.file.is_none() {
				match open_log_file(dir, base_name) {
					Ok(file) => dest.file = Some(file),
					Err(err) => {
						warn!("query log: open failed: {err}");
						next_retry = std::time::Instant::now() + FILE_OPEN_RETRY;
						continue;
					}
				}
			}

			if let Some(file) = &mut dest.file {
				match write_all_retrying(file, &bytes) {
					Ok(()) => {
						dest.written_since_open += bytes.len() as u64;
						wrote_any = true;
					}
					Err(err) => {
						warn!("query log: write failed: {err}");
						dest.file = None;
					}
				}
			}

			if dest.written_since_open >= rotate_size {
				dest.file = None;
				dest.written_since_open = 0;
			}
		}

		if !wrote_any {
			std::thread::sleep(LOOP_SLOWDOWN);
		}
	}
}

fn open_log_file(dir: &str, base_name: &str) -> std::io::Result<File> {
	let name = format!("{base_name}_{}", runtime::time::unix_now());
	let path = std::path::Path::new(dir).join(name);
	OpenOptions::new().create(true).append(true).open(path)
}

fn write_all_retrying(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
	let mut written = 0;
	while written < bytes.len() {
		written += file.write(&bytes[written..])?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::Protocol;

	#[test]
	fn worker_log_flips_and_clears_the_retired_buffer() {
		let mut log = WorkerLog::new(1024);
		assert!(log.flip().is_none());

		log.append("{\"a\":1}");
		let flipped = log.flip().unwrap();
		assert_eq!(&*flipped, b"{\"a\":1}\n".as_slice());

		assert!(log.flip().is_none());
	}

	#[test]
	fn append_drops_lines_that_would_overflow_capacity() {
		let mut log = WorkerLog::new(8);
		assert!(!log.append("this line is far too long for an 8 byte buffer"));
		assert_eq!(log.dropped(), 1);
	}

	#[test]
	fn in_flight_queries_are_never_logged() {
		let q = Query::new(Protocol::Udp);
		assert!(format_record(&q).is_none());
	}

	#[test]
	fn short_header_logs_a_minimal_record() {
		let mut q = Query::new(Protocol::Udp);
		q.end_code = end_code::SHORT_HEADER;
		q.recv_time_ns = 1_700_000_000_000_000_000;

		let line = format_record(&q).unwrap();
		assert!(line.contains("recv_time"));
		assert!(!line.contains("request"));
	}

	#[test]
	fn success_includes_a_request_and_response() {
		let mut q = Query::new(Protocol::Udp);
		q.end_code = 0;
		q.q_name = "example.com".into();
		q.q_type = wire::TYPE_A;
		q.q_class = wire::CLASS_IN;
		q.answer.push(crate::query::Record { name: "example.com".into(), ty: wire::TYPE_A, class: wire::CLASS_IN, ttl: 60, rdata: vec![127, 0, 0, 1] });

		let line = format_record(&q).unwrap();
		assert!(line.contains("\"q_name\":\"example.com\""));
		assert!(line.contains("\"answer\""));
	}

	#[test]
	fn servfail_logs_request_only() {
		let mut q = Query::new(Protocol::Udp);
		q.end_code = 2;
		q.q_name = "example.com".into();

		let line = format_record(&q).unwrap();
		assert!(line.contains("q_name"));
		assert!(!line.contains("response"));
	}
}
