pub mod attempts;
pub mod status;
