pub mod debugger;
pub mod log;
