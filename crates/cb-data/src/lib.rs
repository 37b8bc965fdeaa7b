pub mod telemetry;
pub mod catalog;
pub mod frame;
pub mod memory;
pub mod forecast;

pub use telemetry::*;
pub use catalog::*;
pub use frame::*;
pub use memory::*;
pub use forecast::*;
