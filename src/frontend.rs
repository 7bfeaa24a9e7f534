//! Kernel-language frontend — OpenCL C → SPIR-V through `clspv`.
//!
//! The frontend is an external executable; the driver shuttles the
//! translation unit through a scratch directory and reads the binary
//! back. Its stderr is the program build log, verbatim.

use std::process::Command;

use tempfile::TempDir;

/// Options always passed in addition to the client's: language version,
/// argument-info metadata for the reflector, POD clustering into a UBO,
/// and the feature trims the runtime relies on.
pub const BASELINE_OPTIONS: &[&str] = &[
    "-cl-std=CL1.2",
    "-cl-single-precision-constant",
    "-cl-kernel-arg-info",
    "-pod-ubo",
    "-cluster-pod-kernel-args",
    "-inline-entry-points",
    "-keep-unused-arguments",
    "-spv-version=1.5",
];

const FRONTEND: &str = "clspv";

/// Compile one translation unit. `Err` carries the build log.
pub fn compile(source: &str, options: &str) -> Result<Vec<u32>, String> {
    let dir = TempDir::new().map_err(|e| format!("frontend scratch dir: {}", e))?;
    let input = dir.path().join("program.cl");
    let output = dir.path().join("program.spv");

    std::fs::write(&input, source).map_err(|e| format!("frontend scratch write: {}", e))?;

    let mut command = Command::new(FRONTEND);
    command.args(options.split_whitespace());
    command.args(BASELINE_OPTIONS);
    command.arg(&input).arg("-o").arg(&output);

    log::debug!("frontend: {:?}", command);

    let result = command
        .output()
        .map_err(|e| format!("{}: {}", FRONTEND, e))?;

    let build_log = String::from_utf8_lossy(&result.stderr).into_owned();
    if !result.status.success() {
        return Err(build_log);
    }

    let bytes =
        std::fs::read(&output).map_err(|e| format!("frontend produced no output: {}", e))?;
    words_from_bytes(&bytes).ok_or_else(|| "frontend produced a malformed binary".to_string())
}

/// Reinterpret little-endian bytes as SPIR-V words.
pub fn words_from_bytes(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// True when the frontend executable is reachable.
pub fn is_available() -> bool {
    Command::new(FRONTEND)
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_from_bytes_round() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x05, 0x01, 0x00];
        let words = words_from_bytes(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0500]);
    }

    #[test]
    fn test_words_from_bytes_rejects_ragged_length() {
        assert!(words_from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_compile_simple_kernel() {
        if !is_available() {
            println!("clspv not available, skipping");
            return;
        }

        let words = compile(
            "kernel void noop(global int* out) { out[get_global_id(0)] = 0; }",
            "",
        )
        .unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn test_compile_error_carries_log() {
        if !is_available() {
            println!("clspv not available, skipping");
            return;
        }

        let err = compile("kernel void broken( {", "").unwrap_err();
        assert!(!err.is_empty());
    }
}
