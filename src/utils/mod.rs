#[macro_use]
pub mod serial;
pub mod logger;
pub mod timer;
