//! Contexts — the refcount root every other object hangs off.

use crate::cl::*;
use crate::device::Device;
use crate::format;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};

/// A context binds exactly one device and caches the image formats the
/// driver supports. Descendants (queues, programs, memories, samplers,
/// events) hold strong references back to it, so a context outlives
/// everything created from it.
#[repr(C)]
pub struct Context {
    base: ObjectBase,
    device: &'static Device,
    supported_formats: Vec<cl_image_format>,
}

impl ClObject for Context {
    const KIND: HandleKind = HandleKind::Context;
    const INVALID_HANDLE: cl_int = CL_INVALID_CONTEXT;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

impl Context {
    /// Create a context on the process device.
    pub fn new() -> ClResult<Ref<Context>> {
        let device = Device::get()?;
        Ok(Ref::new(Context {
            base: ObjectBase::new(HandleKind::Context),
            device,
            supported_formats: format::supported_formats(),
        }))
    }

    pub fn device(&self) -> &'static Device {
        self.device
    }

    pub fn supported_image_formats(&self) -> &[cl_image_format] {
        &self.supported_formats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::downcast;

    #[test]
    fn test_context_creation_and_formats() {
        let Ok(ctx) = Context::new() else {
            println!("no device, skipping");
            return;
        };

        assert!(downcast::<Context>(ctx.as_ptr()).is_ok());
        assert!(!ctx.supported_image_formats().is_empty());
        assert_eq!(ctx.base().ref_count(), 1);
    }
}
