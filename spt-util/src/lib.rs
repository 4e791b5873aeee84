pub mod logging;
pub mod math;
pub mod mem;
