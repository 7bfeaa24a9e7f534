//! Cross-translation — SPIR-V → Metal Shading Language.
//!
//! The portable binary stays the program's canonical form; the MSL text
//! produced here is what the library pool actually hands to the native
//! compiler. Workgroup-size spec constants surface as function
//! constants, and spec-constant-sized workgroup arrays surface as
//! `SPIRV_CROSS_CONSTANT_ID_<n>` macros, which is exactly the seam the
//! kernel's defines table drives.

use spirv_cross::{msl, spirv, ErrorCode};

/// Translate a SPIR-V module to MSL source. `Err` carries the
/// translator's message for the build log.
pub fn to_msl(binary: &[u32]) -> Result<String, String> {
    let module = spirv::Module::from_words(binary);

    let mut ast =
        spirv::Ast::<msl::Target>::parse(&module).map_err(describe)?;

    let mut options = msl::CompilerOptions::default();
    options.version = msl::Version::V2_0;
    ast.set_compiler_options(&options).map_err(describe)?;

    ast.compile().map_err(describe)
}

fn describe(error: ErrorCode) -> String {
    match error {
        ErrorCode::CompilationError(message) => message,
        ErrorCode::Unhandled => "unhandled cross-translation error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        assert!(to_msl(&[0xDEAD_BEEF, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_frontend_output_translates() {
        if !crate::frontend::is_available() {
            println!("clspv not available, skipping");
            return;
        }

        let words = crate::frontend::compile(
            "kernel void scale(global float* data, float k) { \
                 data[get_global_id(0)] *= k; \
             }",
            "",
        )
        .unwrap();

        let source = to_msl(&words).unwrap();
        assert!(source.contains("kernel"));
        assert!(source.contains("scale"));
    }
}
