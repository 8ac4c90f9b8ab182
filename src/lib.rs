pub mod bus;
pub mod config;
pub mod cpu_t;
pub mod cpu_vp;
pub mod devices;
pub mod fields;
pub mod i8080;
pub mod parser;
pub mod processor;
pub mod scheduler;
pub mod system;
pub mod terminal;
pub mod termmux;

pub use config::{CardKind, CpuKind, SysCfg};
pub use system::System;
