//! clmetal — an OpenCL 1.2 installable client driver on top of Metal.
//!
//! The crate owns the driver core: the refcounted object model behind
//! the loader's opaque handles, the program pipeline (OpenCL C → SPIR-V
//! → MSL → native library), the kernel pipeline-state cache, memory
//! objects, the event DAG and the command queue. The hundreds of C
//! entry points live in a thin shim outside this crate; they validate
//! pointers, downcast through [`object`], and call into these types.
//!
//! # Layering
//!
//! ```text
//! shim (C ABI) → object/downcast → {context, program, kernel, memory,
//!                                   event, queue, sampler}
//! program → frontend (clspv) → translate (SPIR-V → MSL) → reflect
//! kernel  → library_pool → metal::compile
//! queue   → metal::encode → device
//! ```
//!
//! Everything under [`metal`] is macOS-only; the rest of the crate
//! compiles (and its unit tests run) anywhere.

pub mod cl;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod event;
pub mod format;
pub mod frontend;
pub mod geom;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod object;
pub mod platform;
pub mod program;
pub mod queue;
pub mod reflect;
pub mod sampler;
pub mod translate;

#[cfg(target_os = "macos")]
pub mod library_pool;
#[cfg(target_os = "macos")]
pub mod metal;

pub use cl::{cl_int, ClResult};
pub use context::Context;
pub use device::Device;
pub use event::Event;
pub use kernel::Kernel;
pub use memory::Memory;
pub use object::{downcast, release_handle, retain_handle, Ref};
pub use platform::Platform;
pub use program::Program;
pub use queue::CommandQueue;
pub use sampler::Sampler;
