use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A bounded, lock-free single-producer/single-consumer ring buffer. `N` must be a
/// power of two so that slot indices can be derived with a bitmask rather than a
/// division. `head`/`tail` count pushes/pops monotonically rather than wrapping at
/// `N`, which keeps "full" and "empty" unambiguous without a sentinel slot.
struct Ring<T, const N: usize> {
	buf: [UnsafeCell<MaybeUninit<T>>; N],
	head: AtomicUsize,
	tail: AtomicUsize,
}

unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
	fn new() -> Self {
		assert!(N.is_power_of_two(), "channel capacity must be a power of two");

		Self { buf: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())), head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
	}

	fn try_push(&self, value: T) -> Result<(), T> {
		let head = self.head.load(Ordering::Relaxed);
		let tail = self.tail.load(Ordering::Acquire);

		if head - tail == N {
			return Err(value);
		}

		// SAFETY: only the producer ever writes to `buf[head & (N-1)]`, and it does
		// so before publishing `head` with Release, so the consumer cannot observe
		// the slot until initialization has completed.
		unsafe { (*self.buf[head & (N - 1)].get()).write(value) };
		self.head.store(head + 1, Ordering::Release);

		Ok(())
	}

	fn try_pop(&self) -> Option<T> {
		let tail = self.tail.load(Ordering::Relaxed);
		let head = self.head.load(Ordering::Acquire);

		if tail == head {
			return None;
		}

		// SAFETY: `head`'s Acquire load synchronizes with the producer's Release
		// store, so the slot's write is visible; only the consumer ever reads it.
		let value = unsafe { (*self.buf[tail & (N - 1)].get()).assume_init_read() };
		self.tail.store(tail + 1, Ordering::Release);

		Some(value)
	}
}

impl<T, const N: usize> Drop for Ring<T, N> {
	fn drop(&mut self) {
		while self.try_pop().is_some() {}
	}
}

/// The producing half of a channel.
pub struct Sender<T, const N: usize>(Arc<Ring<T, N>>);

/// The consuming half of a channel.
pub struct Receiver<T, const N: usize>(Arc<Ring<T, N>>);

impl<T, const N: usize> Sender<T, N> {
	/// Enqueues `value`, or hands it back if the channel is full. Used as-is for the
	/// fire-and-forget application-log channel, which drops the message on failure.
	pub fn try_send(&self, value: T) -> Result<(), T> {
		self.0.try_push(value)
	}
}

impl<T, const N: usize> Receiver<T, N> {
	pub fn try_recv(&self) -> Option<T> {
		self.0.try_pop()
	}
}

/// A single bounded SPSC channel.
pub fn channel<T, const N: usize>() -> (Sender<T, N>, Receiver<T, N>) {
	let ring = Arc::new(Ring::new());
	(Sender(ring.clone()), Receiver(ring))
}

/// One side of a transactional, bidirectional pair of channels: a worker sends a
/// request on `tx` and polls `rx` for the matching response before sending again.
/// Built from two independent [`Ring`]s rather than one, since each direction has
/// its own single producer and single consumer.
pub struct Endpoint<Out, In, const N: usize> {
	tx: Sender<Out, N>,
	rx: Receiver<In, N>,
}

impl<Out, In, const N: usize> Endpoint<Out, In, N> {
	pub fn try_send(&self, value: Out) -> Result<(), Out> {
		self.tx.try_send(value)
	}

	pub fn try_recv(&self) -> Option<In> {
		self.rx.try_recv()
	}
}

/// Builds a transactional duplex channel, returning the two endpoints.
pub fn duplex<A, B, const N: usize>() -> (Endpoint<A, B, N>, Endpoint<B, A, N>) {
	let (tx_ab, rx_ab) = channel::<A, N>();
	let (tx_ba, rx_ba) = channel::<B, N>();

	(Endpoint { tx: tx_ab, rx: rx_ba }, Endpoint { tx: tx_ba, rx: rx_ab })
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	#[test]
	fn send_then_recv() {
		let (tx, rx) = channel::<u32, 2>();

		tx.try_send(1).unwrap();
		tx.try_send(2).unwrap();
		assert_eq!(tx.try_send(3), Err(3));

		assert_eq!(rx.try_recv(), Some(1));
		assert_eq!(rx.try_recv(), Some(2));
		assert_eq!(rx.try_recv(), None);
	}

	#[test]
	fn duplex_round_trip() {
		let (worker, admin) = duplex::<&'static str, u32, 2>();

		worker.try_send("set_resource").unwrap();
		assert_eq!(admin.try_recv(), Some("set_resource"));

		admin.try_send(7).unwrap();
		assert_eq!(worker.try_recv(), Some(7));
	}

	#[test]
	fn survives_cross_thread_handoff() {
		let (tx, rx) = channel::<u64, 1024>();

		let producer = thread::spawn(move || {
			for i in 0..1000u64 {
				while tx.try_send(i).is_err() {
					thread::yield_now();
				}
			}
		});

		let mut received = Vec::new();
		while received.len() < 1000 {
			if let Some(v) = rx.try_recv() {
				received.push(v);
			}
		}

		producer.join().unwrap();
		assert_eq!(received, (0..1000).collect::<Vec<_>>());
	}
}
