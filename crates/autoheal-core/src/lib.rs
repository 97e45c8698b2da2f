pub mod analysis;
pub mod config;
pub mod cursor;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod gate;
pub mod handoff;
pub mod io;
pub mod ledger;
pub mod paths;
pub mod resources;
pub mod types;

pub use error::{HealError, Result};
