/// A fixed-capacity, generation-checked slot arena.
pub mod pool;
/// A hash-indexed, insertion-ordered list used to walk entries for timeout sweeps.
pub mod lru;

pub use pool::{Key, Pool};
pub use lru::Lru;
