//! Samplers — an immutable (normalized-coords, addressing, filter)
//! triple realized as an `MTLSamplerState`.

use crate::cl::*;
use crate::context::Context;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};

#[cfg(target_os = "macos")]
use objc2::rc::Retained;
#[cfg(target_os = "macos")]
use objc2::runtime::ProtocolObject;
#[cfg(target_os = "macos")]
use objc2_metal::{
    MTLDevice, MTLSamplerAddressMode, MTLSamplerDescriptor, MTLSamplerMinMagFilter,
    MTLSamplerState,
};

#[repr(C)]
pub struct Sampler {
    base: ObjectBase,
    context: Ref<Context>,
    normalized_coords: cl_bool,
    addressing_mode: cl_addressing_mode,
    filter_mode: cl_filter_mode,
    #[cfg(target_os = "macos")]
    state: SendSamplerState,
}

#[cfg(target_os = "macos")]
struct SendSamplerState(Retained<ProtocolObject<dyn MTLSamplerState>>);

#[cfg(target_os = "macos")]
unsafe impl Send for SendSamplerState {}
#[cfg(target_os = "macos")]
unsafe impl Sync for SendSamplerState {}

impl ClObject for Sampler {
    const KIND: HandleKind = HandleKind::Sampler;
    const INVALID_HANDLE: cl_int = CL_INVALID_SAMPLER;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

#[cfg(target_os = "macos")]
fn address_mode(mode: cl_addressing_mode) -> MTLSamplerAddressMode {
    match mode {
        CL_ADDRESS_CLAMP_TO_EDGE => MTLSamplerAddressMode::ClampToEdge,
        CL_ADDRESS_CLAMP => MTLSamplerAddressMode::ClampToZero,
        CL_ADDRESS_REPEAT => MTLSamplerAddressMode::Repeat,
        CL_ADDRESS_MIRRORED_REPEAT => MTLSamplerAddressMode::MirrorRepeat,
        _ => MTLSamplerAddressMode::ClampToEdge,
    }
}

impl Sampler {
    pub fn new(
        context: &Context,
        normalized_coords: cl_bool,
        addressing_mode: cl_addressing_mode,
        filter_mode: cl_filter_mode,
    ) -> ClResult<Ref<Sampler>> {
        #[cfg(target_os = "macos")]
        {
            let descriptor = unsafe { MTLSamplerDescriptor::new() };
            let filter = match filter_mode {
                CL_FILTER_LINEAR => MTLSamplerMinMagFilter::Linear,
                _ => MTLSamplerMinMagFilter::Nearest,
            };
            let address = address_mode(addressing_mode);
            unsafe {
                descriptor.setNormalizedCoordinates(normalized_coords == CL_TRUE);
                descriptor.setSAddressMode(address);
                descriptor.setTAddressMode(address);
                descriptor.setRAddressMode(address);
                descriptor.setMinFilter(filter);
                descriptor.setMagFilter(filter);
            }

            let state = context
                .device()
                .native()
                .device
                .newSamplerStateWithDescriptor(&descriptor)
                .ok_or(CL_OUT_OF_RESOURCES)?;

            Ok(Ref::new(Sampler {
                base: ObjectBase::new(HandleKind::Sampler),
                context: Ref::from_ref(context),
                normalized_coords,
                addressing_mode,
                filter_mode,
                state: SendSamplerState(state),
            }))
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (context, normalized_coords, addressing_mode, filter_mode);
            Err(CL_DEVICE_NOT_AVAILABLE)
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn normalized_coords(&self) -> cl_bool {
        self.normalized_coords
    }

    pub fn addressing_mode(&self) -> cl_addressing_mode {
        self.addressing_mode
    }

    pub fn filter_mode(&self) -> cl_filter_mode {
        self.filter_mode
    }

    #[cfg(target_os = "macos")]
    pub fn native_state(&self) -> &ProtocolObject<dyn MTLSamplerState> {
        &self.state.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_sampler_round_trip() {
        let Ok(ctx) = Context::new() else {
            println!("no device, skipping");
            return;
        };

        let sampler =
            Sampler::new(&ctx, CL_TRUE, CL_ADDRESS_CLAMP_TO_EDGE, CL_FILTER_LINEAR).unwrap();
        assert_eq!(sampler.normalized_coords(), CL_TRUE);
        assert_eq!(sampler.addressing_mode(), CL_ADDRESS_CLAMP_TO_EDGE);
        assert_eq!(sampler.filter_mode(), CL_FILTER_LINEAR);
    }
}
