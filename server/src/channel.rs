//! Message types for the three cross-thread fabrics a worker participates in:
//! a request/response pair with the resource reloader, a request/response
//! pair with the query-log writer, and a fire-and-forget feed to the
//! application-log writer.
//!
//! All three are built on [`runtime::channel`]'s bounded SPSC rings rather
//! than a mutex-guarded queue, matching the shared-nothing worker model: a
//! worker touches none of this state except through `try_send`/`try_recv`.

use std::sync::Arc;

use runtime::channel::{channel, duplex, Endpoint, Receiver, Sender};

/// Depth of the resource and query-log request/response channels. Each side
/// only ever has one outstanding request at a time, so 2 leaves headroom for
/// the in-flight message plus one queued ack.
pub const CONTROL_DEPTH: usize = 2;

/// Depth of the per-worker application-log feed.
pub const APPLOG_DEPTH: usize = 1024;

/// Sent by the reloader when `resources[index]`'s backing file changed.
/// `data` is the freshly read file contents, shared rather than copied
/// since every worker only ever reads it.
pub struct ResourceUpdate {
	pub index: usize,
	pub data: Arc<Vec<u8>>,
}

/// A worker's acknowledgment that it has installed `index`'s new snapshot
/// and will use it on every subsequent resolve.
pub struct ResourceAck {
	pub index: usize,
}

pub type ReloaderEndpoint = Endpoint<ResourceUpdate, ResourceAck, CONTROL_DEPTH>;
pub type WorkerResourceEndpoint = Endpoint<ResourceAck, ResourceUpdate, CONTROL_DEPTH>;

pub fn resource_channel() -> (ReloaderEndpoint, WorkerResourceEndpoint) {
	duplex()
}

/// Sent by the query-log writer to ask a worker to flip its active buffer.
pub struct FlipRequest;

/// A worker's reply: the bytes that were in the now-inactive buffer, or
/// `None` if nothing had been written since the last flip.
pub struct FlipReply {
	pub bytes: Option<Arc<[u8]>>,
}

pub type QueryLogEndpoint = Endpoint<FlipRequest, FlipReply, CONTROL_DEPTH>;
pub type WorkerQueryLogEndpoint = Endpoint<FlipReply, FlipRequest, CONTROL_DEPTH>;

pub fn query_log_channel() -> (QueryLogEndpoint, WorkerQueryLogEndpoint) {
	duplex()
}

/// Either a canned message (looked up in a static table by the app-log
/// writer, keeping the hot path free of string formatting) or one a worker
/// had to build at runtime.
#[derive(Debug)]
pub enum LogBody {
	Id(u32),
	Text(String),
}

#[derive(Debug)]
pub struct AppLogMessage {
	pub body: LogBody,
	/// When set, the application-log writer prints the message to stderr and
	/// terminates the process after flushing the log file.
	pub fatal: bool,
}

pub type AppLogSender = Sender<AppLogMessage, APPLOG_DEPTH>;
pub type AppLogReceiver = Receiver<AppLogMessage, APPLOG_DEPTH>;

pub fn app_log_channel() -> (AppLogSender, AppLogReceiver) {
	channel()
}

/// Static table for `LogBody::Id`, indexed by message id. Avoids allocating
/// a `String` on the hot path for the handful of conditions worth a log
/// line but not worth per-call formatting.
pub const MESSAGES: &[&str] = &[
	"worker started",
	"resource reload failed",
	"resource reload timed out waiting for worker acknowledgment",
	"query log open failed",
	"query log write failed",
	"application log open failed",
];

pub mod message_id {
	pub const WORKER_STARTED: u32 = 0;
	pub const RESOURCE_RELOAD_FAILED: u32 = 1;
	pub const RESOURCE_RELOAD_TIMEOUT: u32 = 2;
	pub const QUERY_LOG_OPEN_FAILED: u32 = 3;
	pub const QUERY_LOG_WRITE_FAILED: u32 = 4;
	pub const APPLICATION_LOG_OPEN_FAILED: u32 = 5;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_channel_round_trips() {
		let (reloader, worker) = resource_channel();

		reloader.try_send(ResourceUpdate { index: 0, data: Arc::new(vec![1, 2, 3]) }).ok().unwrap();
		let update = worker.try_recv().unwrap();
		assert_eq!(update.index, 0);
		assert_eq!(*update.data, vec![1, 2, 3]);

		worker.try_send(ResourceAck { index: 0 }).ok().unwrap();
		assert_eq!(reloader.try_recv().unwrap().index, 0);
	}

	#[test]
	fn app_log_channel_is_fire_and_forget() {
		let (tx, rx) = app_log_channel();

		tx.try_send(AppLogMessage { body: LogBody::Id(message_id::WORKER_STARTED), fatal: false }).unwrap();

		let msg = rx.try_recv().unwrap();
		assert!(!msg.fatal);
		assert!(matches!(msg.body, LogBody::Id(id) if id == message_id::WORKER_STARTED));
	}
}
