//! Memory objects — buffers, sub-buffer views and images.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(target_os = "macos")]
use std::sync::Arc;

use crate::cl::*;
use crate::context::Context;
use crate::format;
use crate::geom::Size;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};

#[cfg(target_os = "macos")]
use crate::metal::buffer_ops::{RawBuffer, RawTexture};
#[cfg(target_os = "macos")]
use objc2_metal::MTLTextureType;

#[repr(C)]
pub struct Memory {
    base: ObjectBase,
    context: Ref<Context>,
    flags: cl_mem_flags,
    size: usize,
    mem_type: cl_mem_object_type,
    map_count: AtomicU32,
    kind: MemoryKind,
}

enum MemoryKind {
    Buffer {
        /// Shared with any sub-buffers carved out of this allocation.
        #[cfg(target_os = "macos")]
        raw: Arc<RawBuffer>,
        /// Byte offset of this view into `raw`; 0 for a root buffer.
        origin: usize,
        /// Root buffer a sub-buffer keeps alive.
        parent: Option<Ref<Memory>>,
    },
    Image {
        format: cl_image_format,
        extent: Size,
        #[cfg(target_os = "macos")]
        raw: RawTexture,
    },
}

impl ClObject for Memory {
    const KIND: HandleKind = HandleKind::Memory;
    const INVALID_HANDLE: cl_int = CL_INVALID_MEM_OBJECT;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

fn normalize_flags(flags: cl_mem_flags) -> cl_mem_flags {
    if flags == 0 {
        CL_MEM_READ_WRITE
    } else {
        flags
    }
}

impl Memory {
    /// Create a root buffer, honoring the host-pointer flags.
    pub fn new_buffer(
        context: &Context,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> ClResult<Ref<Memory>> {
        if size == 0 || size as cl_ulong > context.device().limits().max_mem_alloc_size {
            return Err(CL_INVALID_BUFFER_SIZE);
        }

        let uses_host = test_any_flag_set(flags, CL_MEM_USE_HOST_PTR | CL_MEM_COPY_HOST_PTR);
        if host_ptr.is_null() == uses_host {
            return Err(CL_INVALID_HOST_PTR);
        }

        #[cfg(target_os = "macos")]
        {
            let device = context.device().native();
            let raw = if test_any_flag_set(flags, CL_MEM_USE_HOST_PTR) {
                // Zero-copy wrap needs page alignment; fall back to a copy.
                RawBuffer::wrap_host(device, host_ptr as *mut u8, size)
                    .or_else(|| RawBuffer::from_bytes(device, host_ptr as *const u8, size))
            } else if test_any_flag_set(flags, CL_MEM_COPY_HOST_PTR) {
                RawBuffer::from_bytes(device, host_ptr as *const u8, size)
            } else {
                RawBuffer::allocate(device, size)
            }
            .ok_or(CL_MEM_OBJECT_ALLOCATION_FAILURE)?;

            Ok(Ref::new(Memory {
                base: ObjectBase::new(HandleKind::Memory),
                context: Ref::from_ref(context),
                flags: normalize_flags(flags),
                size,
                mem_type: CL_MEM_OBJECT_BUFFER,
                map_count: AtomicU32::new(0),
                kind: MemoryKind::Buffer {
                    raw: Arc::new(raw),
                    origin: 0,
                    parent: None,
                },
            }))
        }
        #[cfg(not(target_os = "macos"))]
        {
            Err(CL_MEM_OBJECT_ALLOCATION_FAILURE)
        }
    }

    /// Create a sub-buffer view sharing the parent's storage.
    pub fn new_sub_buffer(
        parent: &Memory,
        flags: cl_mem_flags,
        region: &cl_buffer_region,
    ) -> ClResult<Ref<Memory>> {
        let parent_origin = match &parent.kind {
            // Sub-buffers of sub-buffers are not a thing.
            MemoryKind::Buffer { parent: Some(_), .. } => return Err(CL_INVALID_MEM_OBJECT),
            MemoryKind::Buffer { origin, .. } => *origin,
            MemoryKind::Image { .. } => return Err(CL_INVALID_MEM_OBJECT),
        };

        // Checked: a region whose end wraps must not pass as in-bounds.
        let end = region
            .origin
            .checked_add(region.size)
            .ok_or(CL_INVALID_VALUE)?;
        if region.size == 0 || end > parent.size {
            return Err(CL_INVALID_VALUE);
        }

        let flags = if flags == 0 { parent.flags } else { flags };

        Ok(Ref::new(Memory {
            base: ObjectBase::new(HandleKind::Memory),
            context: parent.context.clone(),
            flags,
            size: region.size,
            mem_type: CL_MEM_OBJECT_BUFFER,
            map_count: AtomicU32::new(0),
            kind: MemoryKind::Buffer {
                #[cfg(target_os = "macos")]
                raw: parent.shared_raw()?,
                origin: parent_origin + region.origin,
                parent: Some(Ref::from_ref(parent)),
            },
        }))
    }

    #[cfg(target_os = "macos")]
    fn shared_raw(&self) -> ClResult<Arc<RawBuffer>> {
        match &self.kind {
            MemoryKind::Buffer { raw, .. } => Ok(Arc::clone(raw)),
            MemoryKind::Image { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    /// Create an image of the given kind. Extents are clamped to >= 1.
    pub fn new_image(
        context: &Context,
        flags: cl_mem_flags,
        image_format: cl_image_format,
        mem_type: cl_mem_object_type,
        extent: Size,
    ) -> ClResult<Ref<Memory>> {
        if !format::is_supported(&image_format) {
            return Err(CL_IMAGE_FORMAT_NOT_SUPPORTED);
        }

        // Host-pointer-backed images are not supported.
        if test_any_flag_set(flags, CL_MEM_USE_HOST_PTR | CL_MEM_COPY_HOST_PTR) {
            return Err(CL_MEM_OBJECT_ALLOCATION_FAILURE);
        }

        let extent = Size::new(extent.w.max(1), extent.h.max(1), extent.d.max(1));
        let size = extent
            .w
            .checked_mul(extent.h)
            .and_then(|n| n.checked_mul(extent.d))
            .and_then(|n| n.checked_mul(format::element_size(&image_format)))
            .ok_or(CL_INVALID_IMAGE_SIZE)?;

        #[cfg(target_os = "macos")]
        {
            let texture_type = match mem_type {
                CL_MEM_OBJECT_IMAGE1D => MTLTextureType::Type1D,
                CL_MEM_OBJECT_IMAGE2D => MTLTextureType::Type2D,
                CL_MEM_OBJECT_IMAGE3D => MTLTextureType::Type3D,
                _ => return Err(CL_INVALID_VALUE),
            };
            let pixel_format =
                format::pixel_format(&image_format).ok_or(CL_IMAGE_FORMAT_NOT_SUPPORTED)?;

            let raw = RawTexture::allocate(context.device().native(), texture_type, pixel_format, extent)
                .ok_or(CL_MEM_OBJECT_ALLOCATION_FAILURE)?;

            Ok(Ref::new(Memory {
                base: ObjectBase::new(HandleKind::Memory),
                context: Ref::from_ref(context),
                flags: normalize_flags(flags),
                size,
                mem_type,
                map_count: AtomicU32::new(0),
                kind: MemoryKind::Image {
                    format: image_format,
                    extent,
                    raw,
                },
            }))
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (context, mem_type, size);
            Err(CL_MEM_OBJECT_ALLOCATION_FAILURE)
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn flags(&self) -> cl_mem_flags {
        self.flags
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mem_type(&self) -> cl_mem_object_type {
        self.mem_type
    }

    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, MemoryKind::Buffer { .. })
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, MemoryKind::Image { .. })
    }

    /// The root buffer backing a sub-buffer, if this is one.
    pub fn parent(&self) -> Option<&Memory> {
        match &self.kind {
            MemoryKind::Buffer { parent, .. } => parent.as_deref(),
            MemoryKind::Image { .. } => None,
        }
    }

    /// Byte offset of this view into its backing allocation.
    pub fn buffer_origin(&self) -> ClResult<usize> {
        match &self.kind {
            MemoryKind::Buffer { origin, .. } => Ok(*origin),
            MemoryKind::Image { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    pub fn image_format(&self) -> ClResult<cl_image_format> {
        match &self.kind {
            MemoryKind::Image { format, .. } => Ok(*format),
            MemoryKind::Buffer { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    pub fn image_extent(&self) -> ClResult<Size> {
        match &self.kind {
            MemoryKind::Image { extent, .. } => Ok(*extent),
            MemoryKind::Buffer { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    /// Bytes per pixel, derived from the image format.
    pub fn image_element_size(&self) -> ClResult<usize> {
        Ok(format::element_size(&self.image_format()?))
    }

    #[cfg(target_os = "macos")]
    pub fn raw_buffer(&self) -> ClResult<(&RawBuffer, usize)> {
        match &self.kind {
            MemoryKind::Buffer { raw, origin, .. } => Ok((raw, *origin)),
            MemoryKind::Image { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    #[cfg(target_os = "macos")]
    pub fn raw_texture(&self) -> ClResult<&RawTexture> {
        match &self.kind {
            MemoryKind::Image { raw, .. } => Ok(raw),
            MemoryKind::Buffer { .. } => Err(CL_INVALID_MEM_OBJECT),
        }
    }

    /// Map the buffer contents into host memory.
    pub fn map(&self, offset: usize) -> ClResult<*mut u8> {
        if offset > self.size {
            return Err(CL_MAP_FAILURE);
        }
        #[cfg(target_os = "macos")]
        {
            let (raw, origin) = self.raw_buffer().map_err(|_| CL_MAP_FAILURE)?;
            let base = raw.contents();
            if base.is_null() {
                return Err(CL_MAP_FAILURE);
            }
            self.map_count.fetch_add(1, Ordering::AcqRel);
            Ok(unsafe { base.add(origin + offset) })
        }
        #[cfg(not(target_os = "macos"))]
        {
            Err(CL_MAP_FAILURE)
        }
    }

    pub fn unmap(&self) {
        let _ = self
            .map_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn context() -> Option<Ref<Context>> {
        Context::new().ok()
    }

    #[test]
    fn test_buffer_size_validation() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        assert_eq!(
            Memory::new_buffer(&ctx, CL_MEM_READ_WRITE, 0, std::ptr::null_mut()).err(),
            Some(CL_INVALID_BUFFER_SIZE)
        );
    }

    #[test]
    fn test_host_ptr_flag_consistency() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let mut data = [0u8; 16];
        // Pointer without a host-pointer flag.
        assert_eq!(
            Memory::new_buffer(
                &ctx,
                CL_MEM_READ_WRITE,
                16,
                data.as_mut_ptr() as *mut c_void
            )
            .err(),
            Some(CL_INVALID_HOST_PTR)
        );
        // Flag without a pointer.
        assert_eq!(
            Memory::new_buffer(&ctx, CL_MEM_COPY_HOST_PTR, 16, std::ptr::null_mut()).err(),
            Some(CL_INVALID_HOST_PTR)
        );
    }

    #[test]
    fn test_copy_host_ptr_initializes_contents() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let mut data: Vec<u8> = (0..64).collect();
        let buffer = Memory::new_buffer(
            &ctx,
            CL_MEM_COPY_HOST_PTR,
            data.len(),
            data.as_mut_ptr() as *mut c_void,
        )
        .unwrap();

        let mapped = buffer.map(0).unwrap();
        for (i, &expected) in data.iter().enumerate() {
            assert_eq!(unsafe { *mapped.add(i) }, expected);
        }
        buffer.unmap();
        assert_eq!(buffer.map_count(), 0);
    }

    #[test]
    fn test_default_flags_are_read_write() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let buffer = Memory::new_buffer(&ctx, 0, 16, std::ptr::null_mut()).unwrap();
        assert_eq!(buffer.flags(), CL_MEM_READ_WRITE);
    }

    #[test]
    fn test_sub_buffer_bounds() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let buffer = Memory::new_buffer(&ctx, 0, 1024, std::ptr::null_mut()).unwrap();

        let region = cl_buffer_region {
            origin: 256,
            size: 256,
        };
        let sub = Memory::new_sub_buffer(&buffer, 0, &region).unwrap();
        assert_eq!(sub.size(), 256);
        assert_eq!(sub.buffer_origin().unwrap(), 256);
        assert!(sub.parent().is_some());

        let out_of_range = cl_buffer_region {
            origin: 1000,
            size: 100,
        };
        assert_eq!(
            Memory::new_sub_buffer(&buffer, 0, &out_of_range).err(),
            Some(CL_INVALID_VALUE)
        );

        // A range whose end wraps around the address space.
        let wrapping = cl_buffer_region {
            origin: usize::MAX - 8,
            size: 64,
        };
        assert_eq!(
            Memory::new_sub_buffer(&buffer, 0, &wrapping).err(),
            Some(CL_INVALID_VALUE)
        );

        // No sub-buffers of sub-buffers.
        assert_eq!(
            Memory::new_sub_buffer(&sub, 0, &region).err(),
            Some(CL_INVALID_MEM_OBJECT)
        );
    }

    #[test]
    fn test_sub_buffer_keeps_parent_alive() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let buffer = Memory::new_buffer(&ctx, 0, 1024, std::ptr::null_mut()).unwrap();
        let region = cl_buffer_region {
            origin: 0,
            size: 512,
        };
        let _sub = Memory::new_sub_buffer(&buffer, 0, &region).unwrap();
        assert_eq!(buffer.base().ref_count(), 2);
    }

    #[test]
    fn test_image_creation_and_element_size() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let rgba8 = cl_image_format {
            image_channel_order: CL_RGBA,
            image_channel_data_type: CL_UNORM_INT8,
        };
        let image = Memory::new_image(
            &ctx,
            CL_MEM_READ_WRITE,
            rgba8,
            CL_MEM_OBJECT_IMAGE2D,
            Size::new(64, 64, 0),
        )
        .unwrap();

        assert!(image.is_image());
        // Depth clamps to 1.
        assert_eq!(image.image_extent().unwrap(), Size::new(64, 64, 1));
        assert_eq!(image.image_element_size().unwrap(), 4);
        assert_eq!(image.size(), 64 * 64 * 4);
    }

    #[test]
    fn test_image_rejects_host_ptr_flags() {
        let Some(ctx) = context() else {
            println!("no device, skipping");
            return;
        };

        let rgba8 = cl_image_format {
            image_channel_order: CL_RGBA,
            image_channel_data_type: CL_UNORM_INT8,
        };
        assert_eq!(
            Memory::new_image(
                &ctx,
                CL_MEM_COPY_HOST_PTR,
                rgba8,
                CL_MEM_OBJECT_IMAGE2D,
                Size::new(4, 4, 1),
            )
            .err(),
            Some(CL_MEM_OBJECT_ALLOCATION_FAILURE)
        );
    }
}
