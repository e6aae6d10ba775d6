//! The application-log writer: drains every worker's fire-and-forget log
//! feed and appends a single vectored write per pass.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Write};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};

use crate::channel::{AppLogMessage, AppLogReceiver, LogBody, MESSAGES};

const FILE_OPEN_RETRY: Duration = Duration::from_secs(5);

/// Runs forever, draining `receivers` and appending their messages to
/// `path`/`name`. Intended as the body of its own OS thread; terminates the
/// process directly if any drained message is marked fatal.
pub fn run(receivers: Vec<AppLogReceiver>, path: &str, name: &str, shutdown: &AtomicBool) {
	std::fs::create_dir_all(path).ok();
	let full_path = std::path::Path::new(path).join(name);

	let mut file: Option<File> = None;
	let mut next_retry = std::time::Instant::now();

	while !runtime::shutdown::requested(shutdown) {
		let mut batch = Vec::new();
		let mut fatal = None;

		for rx in &receivers {
			while let Some(msg) = rx.try_recv() {
				if msg.fatal {
					fatal = Some(resolve_text(&msg));
				}
				batch.push(msg);
			}
		}

		if !batch.is_empty() {
			if file.is_none() && std::time::Instant::now() >= next_retry {
				match OpenOptions::new().create(true).append(true).open(&full_path) {
					Ok(f) => file = Some(f),
					Err(_) => next_retry = std::time::Instant::now() + FILE_OPEN_RETRY,
				}
			}

			if let Some(f) = &mut file {
				if write_batch(f, &batch).is_err() {
					file = None;
				}
			}
		}

		if let Some(text) = fatal {
			eprintln!("fatal: {text}");
			std::process::exit(1);
		}

		if batch.is_empty() {
			std::thread::sleep(Duration::from_millis(10));
		}
	}
}

fn resolve_text(msg: &AppLogMessage) -> String {
	match &msg.body {
		LogBody::Id(id) => MESSAGES.get(*id as usize).copied().unwrap_or("unknown log message").to_string(),
		LogBody::Text(text) => text.clone(),
	}
}

fn write_batch(file: &mut File, batch: &[AppLogMessage]) -> std::io::Result<()> {
	let now = humantime::format_rfc3339_nanos(SystemTime::now()).to_string();
	let sep = " - ";
	let newline = "\n";

	let mut slices = Vec::with_capacity(batch.len() * 3);
	let texts: Vec<String> = batch.iter().map(resolve_text).collect();

	for text in &texts {
		slices.push(IoSlice::new(now.as_bytes()));
		slices.push(IoSlice::new(sep.as_bytes()));
		slices.push(IoSlice::new(text.as_bytes()));
		slices.push(IoSlice::new(newline.as_bytes()));
	}

	let mut slices: &mut [IoSlice] = &mut slices;
	while !slices.is_empty() {
		let n = file.write_vectored(slices)?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "failed to write whole buffer"));
		}
		IoSlice::advance_slices(&mut slices, n);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::channel::app_log_channel;

	#[test]
	fn resolve_text_looks_up_the_static_table() {
		let msg = AppLogMessage { body: LogBody::Id(crate::channel::message_id::WORKER_STARTED), fatal: false };
		assert_eq!(resolve_text(&msg), "worker started");
	}

	#[test]
	fn resolve_text_passes_through_owned_strings() {
		let msg = AppLogMessage { body: LogBody::Text("custom".into()), fatal: false };
		assert_eq!(resolve_text(&msg), "custom");
	}

	#[test]
	fn write_batch_produces_one_line_per_message() {
		let dir = std::env::temp_dir().join(format!("server-applog-test-{:?}", std::thread::current().id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("log");

		let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
		let batch = vec![AppLogMessage { body: LogBody::Text("one".into()), fatal: false }, AppLogMessage { body: LogBody::Text("two".into()), fatal: false }];

		write_batch(&mut file, &batch).unwrap();
		drop(file);

		let contents = std::fs::read_to_string(&path).unwrap();
		assert_eq!(contents.lines().count(), 2);
		assert!(contents.contains(" - one"));
		assert!(contents.contains(" - two"));

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn channel_delivers_in_order() {
		let (tx, rx) = app_log_channel();
		tx.try_send(AppLogMessage { body: LogBody::Text("a".into()), fatal: false }).unwrap();
		tx.try_send(AppLogMessage { body: LogBody::Text("b".into()), fatal: false }).unwrap();

		assert!(matches!(rx.try_recv().unwrap().body, LogBody::Text(s) if s == "a"));
		assert!(matches!(rx.try_recv().unwrap().body, LogBody::Text(s) if s == "b"));
	}
}
