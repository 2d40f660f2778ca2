pub mod atomic;
pub mod mutex;
pub mod spinlock;

pub use mutex::Mutex;
pub use spinlock::SpinLock;
