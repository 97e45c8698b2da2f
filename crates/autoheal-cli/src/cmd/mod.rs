pub mod attempts;
pub mod config;
pub mod extract;
pub mod gate;
pub mod handoff;
pub mod init;
pub mod run;
