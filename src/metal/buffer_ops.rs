//! Raw Metal allocations — buffers and textures backing memory objects.

use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::{
    MTLBuffer, MTLDevice, MTLPixelFormat, MTLResourceOptions, MTLStorageMode, MTLTexture,
    MTLTextureDescriptor, MTLTextureType, MTLTextureUsage,
};

use crate::geom::Size;

use super::device_init::NativeDevice;

/// A shared-storage Metal buffer. The device and the host see the same
/// bytes; ordering between them is the command queue's problem.
pub struct RawBuffer {
    pub(crate) buffer: Retained<ProtocolObject<dyn MTLBuffer>>,
    len: usize,
}

unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    /// Allocate an uninitialized buffer of `len` bytes.
    pub fn allocate(device: &NativeDevice, len: usize) -> Option<RawBuffer> {
        if len == 0 {
            return None;
        }

        let buffer = device
            .device
            .newBufferWithLength_options(len, MTLResourceOptions::StorageModeShared)?;

        Some(RawBuffer { buffer, len })
    }

    /// Allocate a buffer initialized from host memory.
    pub fn from_bytes(device: &NativeDevice, data: *const u8, len: usize) -> Option<RawBuffer> {
        if data.is_null() || len == 0 {
            return None;
        }

        let ptr = NonNull::new(data as *mut std::ffi::c_void)?;
        let buffer = unsafe {
            device.device.newBufferWithBytes_length_options(
                ptr,
                len,
                MTLResourceOptions::StorageModeShared,
            )
        }?;

        Some(RawBuffer { buffer, len })
    }

    /// Wrap a page-aligned host allocation without copying.
    pub fn wrap_host(device: &NativeDevice, data: *mut u8, len: usize) -> Option<RawBuffer> {
        if data.is_null() || len == 0 {
            return None;
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if data as usize % page != 0 || len % page != 0 {
            return None;
        }

        let ptr = NonNull::new(data as *mut std::ffi::c_void)?;
        let buffer = unsafe {
            device.device.newBufferWithBytesNoCopy_length_options_deallocator(
                ptr,
                len,
                MTLResourceOptions::StorageModeShared,
                None,
            )
        }?;

        Some(RawBuffer { buffer, len })
    }

    /// Host-visible pointer to the buffer contents.
    pub fn contents(&self) -> *mut u8 {
        self.buffer.contents().as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// A private-storage Metal texture; all host traffic goes through blits.
pub struct RawTexture {
    pub(crate) texture: Retained<ProtocolObject<dyn MTLTexture>>,
}

unsafe impl Send for RawTexture {}
unsafe impl Sync for RawTexture {}

impl RawTexture {
    pub fn allocate(
        device: &NativeDevice,
        texture_type: MTLTextureType,
        pixel_format: MTLPixelFormat,
        extent: Size,
    ) -> Option<RawTexture> {
        let descriptor = unsafe { MTLTextureDescriptor::new() };
        unsafe {
            descriptor.setTextureType(texture_type);
            descriptor.setPixelFormat(pixel_format);
            descriptor.setWidth(extent.w);
            descriptor.setHeight(extent.h);
            descriptor.setDepth(extent.d);
            descriptor.setStorageMode(MTLStorageMode::Private);
            descriptor.setUsage(MTLTextureUsage::ShaderRead | MTLTextureUsage::ShaderWrite);
        }

        let texture = device.device.newTextureWithDescriptor(&descriptor)?;
        Some(RawTexture { texture })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_write_readback() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let data: Vec<u8> = (0..=255).collect();
        let buf = RawBuffer::from_bytes(&device, data.as_ptr(), data.len()).unwrap();

        assert_eq!(buf.len(), 256);
        let contents = buf.contents();
        for (i, &expected) in data.iter().enumerate() {
            assert_eq!(unsafe { *contents.add(i) }, expected);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        assert!(RawBuffer::allocate(&device, 0).is_none());
    }

    #[test]
    fn test_texture_allocation() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().unwrap();
        let tex = RawTexture::allocate(
            &device,
            MTLTextureType::Type2D,
            MTLPixelFormat::RGBA8Unorm,
            Size::new(16, 16, 1),
        );
        assert!(tex.is_some());
    }
}
