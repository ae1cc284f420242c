//! Device addressing shared by the link and channel layers

pub mod types;

pub use types::*;
