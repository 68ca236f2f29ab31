pub mod control;
pub mod daemon;
pub mod monitor;
pub mod settle;
pub mod status;
pub mod trigger;
