//! Library pool — memoized native libraries per (program, defines).
//!
//! The same program is compiled repeatedly with different local-memory
//! sizes realized as preprocessor defines; the pool makes each distinct
//! (program, defines-text) pair compile once. Entries die with their
//! program.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cl::{ClResult, CL_BUILD_PROGRAM_FAILURE};
use crate::metal::compile::{self, NativeLibrary};
use crate::metal::device_init::NativeDevice;

type PoolKey = (usize, String);

pub struct LibraryPool {
    entries: Mutex<HashMap<PoolKey, Arc<NativeLibrary>>>,
}

impl LibraryPool {
    pub fn new() -> LibraryPool {
        LibraryPool {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get or compile the library for `program_key` with `defines`
    /// prepended to the program's shader source.
    pub fn at(
        &self,
        device: &NativeDevice,
        program_key: usize,
        defines: &str,
        shader_source: &str,
    ) -> ClResult<Arc<NativeLibrary>> {
        let key = (program_key, defines.to_string());

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(library) = entries.get(&key) {
            return Ok(Arc::clone(library));
        }

        let source = if defines.is_empty() {
            shader_source.to_string()
        } else {
            format!("{}\n{}", defines, shader_source)
        };

        let library = compile::compile_library(device, &source).map_err(|e| {
            log::error!("native library compile failed: {}", e);
            CL_BUILD_PROGRAM_FAILURE
        })?;

        let library = Arc::new(library);
        entries.insert(key, Arc::clone(&library));
        Ok(library)
    }

    /// Drop every entry a destroyed program left behind.
    pub fn purge(&self, program_key: usize) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(key, _), _| *key != program_key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        #include <metal_stdlib>
        using namespace metal;

        #ifndef TILE
        #define TILE 1
        #endif

        kernel void fill(device uint* out [[buffer(0)]],
                         uint id [[thread_position_in_grid]]) {
            out[id] = TILE;
        }
    "#;

    #[test]
    fn test_pool_memoizes_per_defines() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let pool = LibraryPool::new();

        let a = pool.at(&device, 1, "", SOURCE).unwrap();
        let b = pool.at(&device, 1, "", SOURCE).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        let c = pool.at(&device, 1, "#define TILE 8", SOURCE).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_purge_drops_program_entries() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let pool = LibraryPool::new();
        pool.at(&device, 1, "", SOURCE).unwrap();
        pool.at(&device, 2, "", SOURCE).unwrap();

        pool.purge(1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_bad_source_is_a_build_failure() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let pool = LibraryPool::new();
        assert_eq!(
            pool.at(&device, 3, "", "kernel void nope(").err(),
            Some(CL_BUILD_PROGRAM_FAILURE)
        );
    }
}
