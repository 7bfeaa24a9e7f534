//! Metal backend — device acquisition, raw allocations, shader
//! compilation and command encoding. Compiled on macOS only; the
//! platform-independent core routes here through `cfg` seams.

pub mod buffer_ops;
pub mod compile;
pub mod device_init;
pub mod encode;
