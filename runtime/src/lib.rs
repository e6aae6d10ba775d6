/// CPU pinning for worker threads.
pub mod affinity;
/// Bounded lock-free SPSC channels, used for the resource/query-log/application-log fabric.
pub mod channel;
/// Edge-triggered readiness notification.
pub mod epoll;
/// The diagnostic (stderr) logger, distinct from the application and query logs.
pub mod logger;
/// Installs the process-wide shutdown flag observed by worker threads.
pub mod shutdown;
/// Wall-clock helpers.
pub mod time;

pub use logger::Logger;
