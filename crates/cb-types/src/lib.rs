pub mod setpoint;
pub mod safety;
pub mod cancel;
pub mod errors;

pub use setpoint::*;
pub use safety::*;
pub use cancel::*;
pub use errors::*;
