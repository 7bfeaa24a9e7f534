//! Process-wide ICD dispatch-table identity.
//!
//! The loader recognizes driver-owned handles by the first pointer-sized
//! word of the object: it must point at this driver's dispatch table. The
//! table itself is a block of function pointers filled in by the C entry
//! shim; the core only ever compares the *address*.

use std::ffi::c_void;

/// Number of entry points in the OpenCL 1.2 + ICD extension table.
pub const DISPATCH_TABLE_ENTRIES: usize = 136;

#[repr(C)]
pub struct DispatchTable {
    entries: [*const c_void; DISPATCH_TABLE_ENTRIES],
}

// The table holds code pointers written once at load time; reads are
// address comparisons only.
unsafe impl Sync for DispatchTable {}

/// The one table every handle in this process points at.
pub static DISPATCH: DispatchTable = DispatchTable {
    entries: [std::ptr::null(); DISPATCH_TABLE_ENTRIES],
};

impl DispatchTable {
    /// Raw table base, handed to the shim so it can install entry points.
    pub fn as_ptr(&self) -> *const c_void {
        self.entries.as_ptr() as *const c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_identity_is_stable() {
        let a = &DISPATCH as *const DispatchTable;
        let b = &DISPATCH as *const DispatchTable;
        assert_eq!(a, b);
    }
}
