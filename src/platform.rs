//! The platform singleton.
//!
//! One platform per process, created on first query and alive for the
//! process lifetime. Identity strings are static; the interesting
//! capability data lives on the device.

use std::sync::OnceLock;

use crate::cl::{cl_int, CL_INVALID_PLATFORM};
use crate::object::{ClObject, HandleKind, ObjectBase};

#[repr(C)]
pub struct Platform {
    base: ObjectBase,
}

impl ClObject for Platform {
    const KIND: HandleKind = HandleKind::Platform;
    const INVALID_HANDLE: cl_int = CL_INVALID_PLATFORM;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

static PLATFORM: OnceLock<&'static Platform> = OnceLock::new();

impl Platform {
    /// The process-wide platform.
    pub fn get() -> &'static Platform {
        PLATFORM.get_or_init(|| {
            Box::leak(Box::new(Platform {
                base: ObjectBase::new(HandleKind::Platform),
            }))
        })
    }

    pub fn profile() -> &'static str {
        "FULL_PROFILE"
    }

    pub fn version() -> &'static str {
        "OpenCL 1.2 clmetal"
    }

    pub fn name() -> &'static str {
        "clmetal"
    }

    pub fn vendor() -> &'static str {
        "clmetal project"
    }

    pub fn extensions() -> &'static str {
        "cl_khr_icd"
    }

    pub fn icd_suffix() -> &'static str {
        "CLM"
    }
}
