//! Native shader compilation — MSL source → `MTLLibrary` →
//! `MTLComputePipelineState` specialized by workgroup-size function
//! constants.

use std::ffi::c_void;
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLComputePipelineState, MTLDataType, MTLDevice, MTLFunctionConstantValues, MTLLibrary,
};

use crate::geom::Size;

use super::device_init::NativeDevice;

/// A compiled MSL library, shared between pipeline specializations.
pub struct NativeLibrary {
    library: Retained<ProtocolObject<dyn MTLLibrary>>,
}

unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

/// A pipeline state plus the limits dispatch needs.
pub struct PipelineState {
    pub pipeline: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
    pub max_total_threads: usize,
    pub execution_width: usize,
}

unsafe impl Send for PipelineState {}
unsafe impl Sync for PipelineState {}

impl Clone for PipelineState {
    fn clone(&self) -> Self {
        PipelineState {
            pipeline: self.pipeline.clone(),
            max_total_threads: self.max_total_threads,
            execution_width: self.execution_width,
        }
    }
}

/// Compile MSL source into a library.
pub fn compile_library(device: &NativeDevice, source: &str) -> Result<NativeLibrary, String> {
    let source_ns = NSString::from_str(source);
    let library = device
        .device
        .newLibraryWithSource_options_error(&source_ns, None)
        .map_err(|e| format!("MSL compilation failed: {}", e.localizedDescription()))?;

    Ok(NativeLibrary { library })
}

/// The workgroup shape enters the shader as three unsigned-int function
/// constants at ids 0, 1 and 2.
fn constant_values(work_group_size: &Size) -> Retained<MTLFunctionConstantValues> {
    let values = MTLFunctionConstantValues::new();
    let dims = [
        work_group_size.w as u32,
        work_group_size.h as u32,
        work_group_size.d as u32,
    ];

    for (index, dim) in dims.iter().enumerate() {
        unsafe {
            values.setConstantValue_type_atIndex(
                NonNull::new_unchecked(dim as *const u32 as *mut c_void),
                MTLDataType::UInt,
                index,
            );
        }
    }

    values
}

/// Specialize `fn_name` from `library` for a workgroup shape and build
/// its compute pipeline state.
pub fn make_pipeline(
    device: &NativeDevice,
    library: &NativeLibrary,
    fn_name: &str,
    work_group_size: &Size,
) -> Result<PipelineState, String> {
    let fn_name_ns = NSString::from_str(fn_name);
    let values = constant_values(work_group_size);

    let function = library
        .library
        .newFunctionWithName_constantValues_error(&fn_name_ns, &values)
        .map_err(|e| {
            format!(
                "function '{}' specialization failed: {}",
                fn_name,
                e.localizedDescription()
            )
        })?;

    let pipeline = device
        .device
        .newComputePipelineStateWithFunction_error(&function)
        .map_err(|e| format!("pipeline creation failed: {}", e.localizedDescription()))?;

    let max_total_threads = pipeline.maxTotalThreadsPerThreadgroup();
    let execution_width = pipeline.threadExecutionWidth();

    Ok(PipelineState {
        pipeline,
        max_total_threads,
        execution_width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        #include <metal_stdlib>
        using namespace metal;

        constant uint wg_x [[function_constant(0)]];

        kernel void scale(
            device const float* a [[buffer(0)]],
            device float* result  [[buffer(1)]],
            uint id [[thread_position_in_grid]]
        ) {
            result[id] = a[id] * float(wg_x);
        }
    "#;

    #[test]
    fn test_compile_and_specialize() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let library = compile_library(&device, SOURCE).unwrap();

        let pipeline = make_pipeline(&device, &library, "scale", &Size::new(32, 1, 1)).unwrap();
        assert!(pipeline.max_total_threads > 0);
        assert!(pipeline.execution_width > 0);
    }

    #[test]
    fn test_compile_error_reported() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let result = compile_library(&device, "kernel void broken(");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_function_rejected() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let library = compile_library(&device, SOURCE).unwrap();
        assert!(make_pipeline(&device, &library, "missing", &Size::ONE).is_err());
    }
}
