//! Bootstrap: parse configuration, wire up the control channels, spawn the
//! auxiliary threads (application log, query log, resource reloader), spawn
//! one pinned vector-loop per worker, and block until shutdown.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::LevelFilter;

use server::channel::{app_log_channel, query_log_channel, resource_channel};
use server::config::Config;
use server::metrics::Metrics;
use server::worker::Worker;

fn main() {
	log::set_logger(&runtime::Logger).expect("logger installed exactly once");
	log::set_max_level(LevelFilter::Info);

	let config = match Config::parse(std::env::args().skip(1)) {
		Ok(Ok(config)) => config,
		Ok(Err(server::config::HelpRequested)) => std::process::exit(0),
		Err(err) => {
			eprintln!("dnsd: {err}");
			std::process::exit(1);
		}
	};

	let config = Arc::new(config);
	let metrics = Arc::new(Metrics::new());
	let shutdown = runtime::shutdown::install();

	let (app_log_tx, app_log_rx): (Vec<_>, Vec<_>) = (0..config.process_thread_count).map(|_| app_log_channel()).unzip();
	let (query_log_endpoints, worker_query_log_endpoints): (Vec<_>, Vec<_>) = (0..config.process_thread_count).map(|_| query_log_channel()).unzip();
	let (reloader_endpoints, worker_resource_endpoints): (Vec<_>, Vec<_>) = (0..config.process_thread_count).map(|_| resource_channel()).unzip();

	let app_log_handle = spawn_app_log(&config, app_log_rx, &shutdown);
	let query_log_handle = spawn_query_log(&config, query_log_endpoints, &shutdown);
	let resource_handle = spawn_resource_reloader(&config, reloader_endpoints, &shutdown);

	let mut worker_handles = Vec::with_capacity(config.process_thread_count);

	for (id, ((resource_chan, querylog_chan), applog)) in worker_resource_endpoints.into_iter().zip(worker_query_log_endpoints).zip(app_log_tx).enumerate() {
		let config = config.clone();
		let metrics = metrics.clone();
		let shutdown = shutdown.clone();

		let mask = config.process_thread_masks.get(id).copied();

		worker_handles.push(std::thread::spawn(move || {
			if let Some(cpu) = mask {
				if let Err(err) = runtime::affinity::pin_to_cpu(cpu) {
					log::warn!("worker {id}: failed to pin to cpu {cpu}: {err}");
				}
			}

			let mut worker = match Worker::new(id, config, metrics, resource_chan, querylog_chan, applog) {
				Ok(worker) => worker,
				Err(err) => {
					log::error!("worker {id}: failed to initialize: {err}");
					std::process::exit(1);
				}
			};

			worker.run(&shutdown);
		}));
	}

	for handle in worker_handles {
		handle.join().ok();
	}

	resource_handle.join().ok();
	query_log_handle.join().ok();
	app_log_handle.join().ok();
}

fn spawn_app_log(config: &Arc<Config>, receivers: Vec<server::channel::AppLogReceiver>, shutdown: &Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
	let path = config.app_log_path.clone();
	let name = config.app_log_name.clone();
	let shutdown = shutdown.clone();

	std::thread::spawn(move || server::applog::run(receivers, &path, &name, &shutdown))
}

fn spawn_query_log(config: &Arc<Config>, endpoints: Vec<server::channel::QueryLogEndpoint>, shutdown: &Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
	let dir = config.query_log_path.clone();
	let base_name = config.query_log_base_name.clone();
	let rotate_size = config.query_log_rotate_size;
	let shutdown = shutdown.clone();

	std::thread::spawn(move || server::querylog::run(endpoints, &dir, &base_name, rotate_size, &shutdown))
}

fn spawn_resource_reloader(config: &Arc<Config>, endpoints: Vec<server::channel::ReloaderEndpoint>, shutdown: &Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
	let resources = config.resources.clone();
	let shutdown = shutdown.clone();

	std::thread::spawn(move || server::resource::run(&resources, endpoints, &shutdown))
}
