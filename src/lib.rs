pub mod cart;
pub mod clock;
pub mod config;
pub mod engine;
pub mod fields;
pub mod hours;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod services;
pub mod wal;
