//! Process-wide helpers shared by the register server binaries.

pub mod logging;
pub mod version;
