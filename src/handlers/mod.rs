pub mod info;
pub mod monitor;

pub use info::*;
pub use monitor::*;
