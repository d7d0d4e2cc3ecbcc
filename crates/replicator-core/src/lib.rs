pub mod capture;
pub mod capture_loop;
pub mod config;
pub mod display;
pub mod protocol;
pub mod registry;
pub mod slot;
pub mod worker;
