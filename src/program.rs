//! Programs — source accumulation, the build pipeline, and reflection.
//!
//! A program is the canonical owner of one compiled module: the SPIR-V
//! words (its queryable binary), the MSL translation the library pool
//! compiles from, and the per-kernel argument reflection. Building runs
//! frontend → cross-translate → reflect; creating from a binary skips
//! the frontend but still translates and reflects.

use std::sync::Mutex;

use crate::cl::*;
use crate::context::Context;
use crate::frontend;
use crate::geom::Size;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};
use crate::reflect::{self, Binding, Reflection};
use crate::translate;

struct ProgramState {
    source: String,
    options: String,
    log: String,
    build_status: cl_build_status,
    binary: Vec<u32>,
    msl: String,
    reflection: Reflection,
}

#[repr(C)]
pub struct Program {
    base: ObjectBase,
    context: Ref<Context>,
    state: Mutex<ProgramState>,
}

impl ClObject for Program {
    const KIND: HandleKind = HandleKind::Program;
    const INVALID_HANDLE: cl_int = CL_INVALID_PROGRAM;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

impl Program {
    pub fn new(context: &Context) -> Ref<Program> {
        Ref::new(Program {
            base: ObjectBase::new(HandleKind::Program),
            context: Ref::from_ref(context),
            state: Mutex::new(ProgramState {
                source: String::new(),
                options: String::new(),
                log: String::new(),
                build_status: CL_BUILD_NONE,
                binary: Vec::new(),
                msl: String::new(),
                reflection: Reflection::default(),
            }),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Append one source fragment to the translation unit.
    pub fn add_source(&self, fragment: &str) {
        let mut state = self.lock();
        state.source.push_str(fragment);
        if !fragment.ends_with('\n') {
            state.source.push('\n');
        }
    }

    /// Install a prebuilt portable binary. The byte stream must be a
    /// whole number of 32-bit words.
    pub fn set_binary_bytes(&self, bytes: &[u8]) -> ClResult<()> {
        let words = frontend::words_from_bytes(bytes).ok_or(CL_INVALID_BINARY)?;
        self.lock().binary = words;
        Ok(())
    }

    pub fn source(&self) -> String {
        self.lock().source.clone()
    }

    pub fn options(&self) -> String {
        self.lock().options.clone()
    }

    pub fn build_log(&self) -> String {
        self.lock().log.clone()
    }

    pub fn build_status(&self) -> cl_build_status {
        self.lock().build_status
    }

    pub fn binary(&self) -> Vec<u32> {
        self.lock().binary.clone()
    }

    pub fn binary_size_bytes(&self) -> usize {
        self.lock().binary.len() * std::mem::size_of::<u32>()
    }

    /// Copy the binary into a caller-provided destination.
    pub fn copy_binary_into(&self, destination: &mut [u8]) -> ClResult<()> {
        let state = self.lock();
        let byte_len = state.binary.len() * 4;
        if destination.len() < byte_len {
            return Err(CL_INVALID_VALUE);
        }
        for (chunk, word) in destination.chunks_exact_mut(4).zip(&state.binary) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Compile the program for this context's device.
    pub fn build(&self, options: Option<&str>) -> ClResult<()> {
        let mut state = self.lock();
        if let Some(options) = options {
            state.options = options.to_string();
        }
        state.build_status = CL_BUILD_IN_PROGRESS;
        state.log.clear();

        if state.binary.is_empty() {
            let source = state.source.clone();
            let options = state.options.clone();
            match frontend::compile(&source, &options) {
                Ok(words) => state.binary = words,
                Err(build_log) => {
                    log::error!("frontend failed:\n{}", build_log);
                    state.log = build_log;
                    state.build_status = CL_BUILD_ERROR;
                    return Err(CL_BUILD_PROGRAM_FAILURE);
                }
            }
        }

        match translate::to_msl(&state.binary) {
            Ok(msl) => state.msl = msl,
            Err(message) => {
                log::error!("cross-translation failed: {}", message);
                state.log.push_str(&message);
                state.build_status = CL_BUILD_ERROR;
                return Err(CL_BUILD_PROGRAM_FAILURE);
            }
        }

        match reflect::reflect(&state.binary) {
            Ok(reflection) => state.reflection = reflection,
            Err(_) => {
                state.log.push_str("binary carries no argument reflection\n");
                state.build_status = CL_BUILD_ERROR;
                return Err(CL_BUILD_PROGRAM_FAILURE);
            }
        }

        state.build_status = CL_BUILD_SUCCESS;
        log::info!(
            "built program with kernel(s): {}",
            state.reflection.kernel_names().join(";")
        );
        Ok(())
    }

    /// The translated shader source; only present after a successful
    /// build.
    pub fn msl_source(&self) -> ClResult<String> {
        let state = self.lock();
        if state.build_status != CL_BUILD_SUCCESS {
            return Err(CL_INVALID_PROGRAM_EXECUTABLE);
        }
        Ok(state.msl.clone())
    }

    /// Bindings for one kernel, sorted by ordinal.
    pub fn bindings_for(&self, kernel_name: &str) -> ClResult<Vec<Binding>> {
        let state = self.lock();
        if state.build_status != CL_BUILD_SUCCESS {
            return Err(CL_INVALID_PROGRAM_EXECUTABLE);
        }
        state
            .reflection
            .arguments
            .get(kernel_name)
            .cloned()
            .ok_or(CL_INVALID_KERNEL_NAME)
    }

    /// Compile-time required workgroup size; zero when undeclared.
    pub fn required_work_group_size(&self, kernel_name: &str) -> Size {
        self.lock()
            .reflection
            .required_work_group_size
            .get(kernel_name)
            .copied()
            .unwrap_or(Size::ZERO)
    }

    pub fn kernel_count(&self) -> usize {
        self.lock().reflection.arguments.len()
    }

    /// Kernel names joined with `;`, the program-info wire format.
    pub fn kernel_names(&self) -> String {
        self.lock().reflection.kernel_names().join(";")
    }

    /// Identity key for pool entries tied to this program.
    pub fn pool_key(&self) -> usize {
        self as *const Program as usize
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgramState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(target_os = "macos")]
impl Drop for Program {
    fn drop(&mut self) {
        if let Ok(device) = crate::device::Device::get() {
            device.library_pool().purge(self.pool_key());
        }
    }
}
