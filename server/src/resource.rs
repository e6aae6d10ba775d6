//! The resource reloader: polls each configured file for changes and pushes
//! a fresh snapshot out to every worker, waiting for all of them to
//! acknowledge before retiring the old one.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use crate::channel::{ReloaderEndpoint, ResourceUpdate};
use crate::config::ResourceConfig;

/// One watched resource's reload state: identity, polling cadence, and the
/// currently adopted snapshot plus the mtime it was loaded at. Releasing the
/// old snapshot has no explicit step here: a `Vec<u8>` just drops itself
/// once the last `Arc` referencing it is gone.
struct Resource {
	index: usize,
	name: String,
	filepath: String,
	update_frequency: Duration,
	next_update: std::time::Instant,
	current: Arc<Vec<u8>>,
	mtime: Option<std::time::SystemTime>,
}

enum LoadOutcome {
	Unchanged,
	Changed(Arc<Vec<u8>>, std::time::SystemTime),
	Error,
}

impl Resource {
	fn check_load(&self) -> LoadOutcome {
		let meta = match fs::metadata(&self.filepath) {
			Ok(meta) => meta,
			Err(err) => {
				warn!("resource {}: stat {} failed: {err}", self.name, self.filepath);
				return LoadOutcome::Error;
			}
		};

		let mtime = match meta.modified() {
			Ok(mtime) => mtime,
			Err(_) => return LoadOutcome::Error,
		};

		if self.mtime == Some(mtime) {
			return LoadOutcome::Unchanged;
		}

		match fs::read(&self.filepath) {
			Ok(bytes) => LoadOutcome::Changed(Arc::new(bytes), mtime),
			Err(err) => {
				warn!("resource {}: read {} failed: {err}", self.name, self.filepath);
				LoadOutcome::Error
			}
		}
	}
}

/// How long the reloader waits for every worker to acknowledge a pushed
/// update before giving up and logging a fatal error.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs forever, polling resources in due-time order and fanning updates out
/// to `workers`. Intended to be the body of its own OS thread, started by
/// the bootstrap in `bin/dnsd.rs`.
pub fn run(resources: &[ResourceConfig], workers: Vec<ReloaderEndpoint>, shutdown: &std::sync::atomic::AtomicBool) {
	let mut state: Vec<Resource> = resources
		.iter()
		.enumerate()
		.map(|(index, cfg)| Resource {
			index,
			name: cfg.name.clone(),
			filepath: cfg.filepath.clone(),
			update_frequency: Duration::from_secs(cfg.update_freq_secs),
			next_update: std::time::Instant::now(),
			current: Arc::new(Vec::new()),
			mtime: None,
		})
		.collect();

	while !runtime::shutdown::requested(shutdown) {
		let Some((due, _)) = state.iter().enumerate().min_by_key(|(_, r)| r.next_update) else {
			return;
		};

		let now = std::time::Instant::now();
		if state[due].next_update > now {
			std::thread::sleep((state[due].next_update - now).min(Duration::from_millis(200)));
			continue;
		}

		match state[due].check_load() {
			LoadOutcome::Unchanged => {}
			LoadOutcome::Error => {}
			LoadOutcome::Changed(data, mtime) => {
				broadcast_and_wait(&mut state[due], data.clone(), &workers);
				state[due].current = data;
				state[due].mtime = Some(mtime);
			}
		}

		state[due].next_update = std::time::Instant::now() + state[due].update_frequency;
	}
}

fn broadcast_and_wait(resource: &mut Resource, data: Arc<Vec<u8>>, workers: &[ReloaderEndpoint]) {
	for worker in workers {
		while worker.try_send(ResourceUpdate { index: resource.index, data: data.clone() }).is_err() {
			std::thread::yield_now();
		}
	}

	let deadline = std::time::Instant::now() + ACK_TIMEOUT;
	let mut acked = vec![false; workers.len()];

	while acked.iter().any(|&a| !a) {
		if std::time::Instant::now() > deadline {
			error!("resource {}: {} of {} workers never acknowledged the reload", resource.name, acked.iter().filter(|a| !**a).count(), workers.len());
			return;
		}

		for (i, worker) in workers.iter().enumerate() {
			if !acked[i] {
				if let Some(ack) = worker.try_recv() {
					debug_assert_eq!(ack.index, resource.index);
					acked[i] = true;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::channel::resource_channel;
	use std::io::Write;

	#[test]
	fn detects_a_changed_file_and_reloads_its_contents() {
		let mut path = std::env::temp_dir();
		path.push(format!("server-resource-test-{:?}", std::thread::current().id()));

		fs::write(&path, b"v1").unwrap();

		let mut resource = Resource {
			index: 0,
			name: "test".into(),
			filepath: path.to_string_lossy().into_owned(),
			update_frequency: Duration::from_secs(5),
			next_update: std::time::Instant::now(),
			current: Arc::new(Vec::new()),
			mtime: None,
		};

		let LoadOutcome::Changed(data, mtime) = resource.check_load() else { panic!("expected a change on first load") };
		assert_eq!(*data, b"v1");
		resource.current = data;
		resource.mtime = Some(mtime);

		assert!(matches!(resource.check_load(), LoadOutcome::Unchanged));

		std::thread::sleep(Duration::from_millis(10));
		let mut f = fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
		f.write_all(b"v2").unwrap();
		drop(f);

		let LoadOutcome::Changed(data, _) = resource.check_load() else { panic!("expected a change after rewrite") };
		assert_eq!(*data, b"v2");

		fs::remove_file(&path).ok();
	}

	#[test]
	fn broadcast_and_wait_resolves_once_every_worker_acks() {
		let (reloader_side, worker_side) = resource_channel();

		let mut resource = Resource {
			index: 3,
			name: "test".into(),
			filepath: String::new(),
			update_frequency: Duration::from_secs(5),
			next_update: std::time::Instant::now(),
			current: Arc::new(Vec::new()),
			mtime: None,
		};

		let handle = std::thread::spawn(move || {
			let update = worker_side.try_recv();
			let mut update = update;
			while update.is_none() {
				update = worker_side.try_recv();
			}
			let update = update.unwrap();
			worker_side.try_send(crate::channel::ResourceAck { index: update.index }).ok().unwrap();
		});

		broadcast_and_wait(&mut resource, Arc::new(vec![1, 2, 3]), std::slice::from_ref(&reloader_side));
		handle.join().unwrap();
	}
}
