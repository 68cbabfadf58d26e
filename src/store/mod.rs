pub mod atomic;
pub mod coordinator;
pub mod lock;

pub use coordinator::{merge, with_locked_index};
pub use lock::StoreLock;
