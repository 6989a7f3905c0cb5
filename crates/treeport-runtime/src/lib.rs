pub mod batcher;
pub mod pool;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use batcher::*;
pub use pool::*;
pub use request::*;
pub use scheduler::*;
pub use worker::*;
