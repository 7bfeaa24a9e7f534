//! Kernels — argument slots, specialization defines, and the
//! pipeline-state cache.
//!
//! The cache is keyed twice: first by a 64-bit hash of the workgroup
//! shape, then by the concatenated specialization defines. The entry
//! under the reserved hash 0 — workgroup (1,1,1), no defines — is
//! compiled at construction and answers the preferred-workgroup queries,
//! so a kernel that cannot produce any pipeline never exists.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::sync::Mutex;

use crate::cl::*;
use crate::context::Context;
#[cfg(target_os = "macos")]
use crate::geom::work_group_hash;
use crate::geom::Size;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};
use crate::program::Program;
use crate::reflect::{ArgKind, Binding};

#[cfg(target_os = "macos")]
use crate::metal::compile::{self, PipelineState};

/// Sentinel first-level key for the pre-warmed (1,1,1) entry.
#[cfg(target_os = "macos")]
const WARM_HASH: u64 = 0;

/// One argument slot: the binding it belongs to plus whatever bytes the
/// client last set.
#[derive(Clone)]
pub struct Arg {
    pub kind: ArgKind,
    pub index: u32,
    pub bytes: Vec<u8>,
    pub size: usize,
}

/// A snapshot of one argument at enqueue time.
#[derive(Clone)]
pub struct ArgSnapshot {
    pub binding: Binding,
    pub bytes: Vec<u8>,
    pub size: usize,
}

struct KernelState {
    args: HashMap<u32, Arg>,
    /// Ordinal → `#define` line for Local bindings that received a size.
    defines: BTreeMap<u32, String>,
    #[cfg(target_os = "macos")]
    pipelines: HashMap<u64, HashMap<String, PipelineState>>,
}

#[repr(C)]
pub struct Kernel {
    base: ObjectBase,
    program: Ref<Program>,
    name: String,
    bindings: Vec<Binding>,
    required_work_group_size: Size,
    state: Mutex<KernelState>,
}

impl ClObject for Kernel {
    const KIND: HandleKind = HandleKind::Kernel;
    const INVALID_HANDLE: cl_int = CL_INVALID_KERNEL;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

/// The define a sized Local binding contributes; `count` is the element
/// count the requested byte size works out to.
pub(crate) fn local_size_define(spec: u32, count: usize) -> String {
    format!("#define SPIRV_CROSS_CONSTANT_ID_{} {}\n", spec, count)
}

/// Specialization text: the defines map's values in ordinal order.
pub(crate) fn concat_defines(defines: &BTreeMap<u32, String>) -> String {
    defines.values().cloned().collect()
}

impl Kernel {
    pub fn new(program: &Program, name: &str) -> ClResult<Ref<Kernel>> {
        let mut bindings = program.bindings_for(name)?;
        bindings.sort_by_key(|b| b.ordinal);

        let args = bindings
            .iter()
            .map(|b| {
                (
                    b.ordinal,
                    Arg {
                        kind: b.kind,
                        index: b.index,
                        bytes: Vec::new(),
                        size: 0,
                    },
                )
            })
            .collect();

        let kernel = Ref::new(Kernel {
            base: ObjectBase::new(HandleKind::Kernel),
            program: Ref::from_ref(program),
            name: name.to_string(),
            required_work_group_size: program.required_work_group_size(name),
            bindings,
            state: Mutex::new(KernelState {
                args,
                defines: BTreeMap::new(),
                #[cfg(target_os = "macos")]
                pipelines: HashMap::new(),
            }),
        });

        // Pre-warm the cache; a kernel that cannot compile is not a
        // kernel.
        #[cfg(target_os = "macos")]
        {
            let mut state = kernel.lock();
            kernel
                .add_pipeline(&mut state, WARM_HASH, &Size::ONE)
                .map_err(|_| CL_INVALID_PROGRAM_EXECUTABLE)?;
        }

        Ok(kernel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn context(&self) -> &Context {
        self.program.context()
    }

    pub fn num_args(&self) -> usize {
        self.bindings.len()
    }

    /// Compile-time `reqd_work_group_size`; zero when the kernel has none.
    pub fn required_work_group_size(&self) -> Size {
        self.required_work_group_size
    }

    /// Set one argument. Local bindings turn the byte size into a
    /// specialization define; everything else copies the bytes into the
    /// slot. POD sizes are not validated here — the encoder owns that.
    pub fn set_arg(&self, index: usize, data: *const c_void, size: usize) -> ClResult<()> {
        let binding = self.bindings.get(index).ok_or(CL_INVALID_ARG_INDEX)?;
        let mut state = self.lock();

        if binding.kind == ArgKind::Local {
            if binding.size == 0 || size == 0 {
                return Err(CL_INVALID_ARG_SIZE);
            }
            let count = size / binding.size as usize;
            state
                .defines
                .insert(binding.ordinal, local_size_define(binding.spec, count));
            return Ok(());
        }

        let arg = state
            .args
            .get_mut(&binding.ordinal)
            .ok_or(CL_INVALID_ARG_INDEX)?;
        if !data.is_null() {
            arg.bytes = unsafe {
                std::slice::from_raw_parts(data as *const u8, size).to_vec()
            };
        }
        arg.size = size;
        Ok(())
    }

    /// Snapshot every argument with its binding, in ordinal order.
    pub fn args_snapshot(&self) -> Vec<ArgSnapshot> {
        let state = self.lock();
        self.bindings
            .iter()
            .map(|binding| {
                let arg = &state.args[&binding.ordinal];
                ArgSnapshot {
                    binding: binding.clone(),
                    bytes: arg.bytes.clone(),
                    size: arg.size,
                }
            })
            .collect()
    }

    /// The current specialization text.
    pub fn defines_text(&self) -> String {
        concat_defines(&self.lock().defines)
    }

    /// The pipeline state specialized for `work_group_size` under the
    /// current defines, compiling on first use.
    #[cfg(target_os = "macos")]
    pub fn pipeline_state(&self, work_group_size: &Size) -> ClResult<PipelineState> {
        let hash = work_group_hash(work_group_size);
        let mut state = self.lock();

        let defines = concat_defines(&state.defines);
        let missing = state
            .pipelines
            .get(&hash)
            .and_then(|per_defines| per_defines.get(&defines))
            .is_none();
        if missing {
            self.add_pipeline(&mut state, hash, work_group_size)?;
        }

        Ok(state.pipelines[&hash][&defines].clone())
    }

    /// Device-chosen workgroup capacity, from the pre-warmed entry.
    #[cfg(target_os = "macos")]
    pub fn max_work_group_size(&self) -> usize {
        self.lock().pipelines[&WARM_HASH][""].max_total_threads
    }

    /// Preferred workgroup size multiple, from the pre-warmed entry.
    #[cfg(target_os = "macos")]
    pub fn work_item_execution_width(&self) -> usize {
        self.lock().pipelines[&WARM_HASH][""].execution_width
    }

    /// Cache keys currently present, for inspection.
    #[cfg(target_os = "macos")]
    pub fn pipeline_cache_keys(&self) -> Vec<(u64, String)> {
        let state = self.lock();
        let mut keys: Vec<(u64, String)> = state
            .pipelines
            .iter()
            .flat_map(|(hash, per_defines)| {
                per_defines.keys().map(|d| (*hash, d.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    #[cfg(target_os = "macos")]
    fn add_pipeline(
        &self,
        state: &mut KernelState,
        hash: u64,
        work_group_size: &Size,
    ) -> ClResult<()> {
        let device = self.context().device();
        let defines = concat_defines(&state.defines);

        let library = device.library_pool().at(
            device.native(),
            self.program.pool_key(),
            &defines,
            &self.program.msl_source()?,
        )?;

        let pipeline =
            compile::make_pipeline(device.native(), &library, &self.name, work_group_size)
                .map_err(|e| {
                    log::error!("pipeline specialization failed: {}", e);
                    CL_BUILD_PROGRAM_FAILURE
                })?;

        state
            .pipelines
            .entry(hash)
            .or_default()
            .insert(defines, pipeline);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_size_define_text() {
        assert_eq!(
            local_size_define(3, 64),
            "#define SPIRV_CROSS_CONSTANT_ID_3 64\n"
        );
    }

    #[test]
    fn test_defines_concatenate_in_ordinal_order() {
        let mut defines = BTreeMap::new();
        defines.insert(4, local_size_define(9, 16));
        defines.insert(1, local_size_define(5, 64));
        let text = concat_defines(&defines);
        assert_eq!(
            text,
            "#define SPIRV_CROSS_CONSTANT_ID_5 64\n#define SPIRV_CROSS_CONSTANT_ID_9 16\n"
        );
    }

    #[test]
    fn test_kernel_creation_requires_built_program() {
        let Ok(ctx) = Context::new() else {
            println!("no device, skipping");
            return;
        };

        let program = Program::new(&ctx);
        assert_eq!(
            Kernel::new(&program, "vadd").err(),
            Some(CL_INVALID_PROGRAM_EXECUTABLE)
        );
    }
}
