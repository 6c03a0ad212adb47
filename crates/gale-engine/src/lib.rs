pub mod runner;
pub mod scheduler;

pub use runner::*;
pub use scheduler::*;
