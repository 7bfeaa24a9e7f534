//! The device singleton — static capability table, the native Metal
//! device, and the process-wide library pool.

use std::sync::OnceLock;

use crate::cl::*;
use crate::object::{ClObject, HandleKind, ObjectBase};

#[cfg(target_os = "macos")]
use crate::library_pool::LibraryPool;
#[cfg(target_os = "macos")]
use crate::metal::device_init::NativeDevice;

/// Static capability report handed out through the device-info queries.
pub struct DeviceLimits {
    pub device_type: cl_device_type,
    pub vendor_id: cl_uint,
    pub max_compute_units: cl_uint,
    pub max_work_item_dimensions: cl_uint,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub max_mem_alloc_size: cl_ulong,
    pub global_mem_size: cl_ulong,
    pub local_mem_size: cl_ulong,
    pub max_parameter_size: usize,
    pub max_samplers: cl_uint,
    pub mem_base_addr_align: cl_uint,
    pub image_support: cl_bool,
    pub max_read_image_args: cl_uint,
    pub max_write_image_args: cl_uint,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    pub image3d_max_width: usize,
    pub image3d_max_height: usize,
    pub image3d_max_depth: usize,
    pub max_constant_buffer_size: cl_ulong,
    pub max_constant_args: cl_uint,
    pub available: cl_bool,
    pub compiler_available: cl_bool,
    pub endian_little: cl_bool,
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub profile: String,
    pub version: String,
    pub c_version: String,
    pub extensions: String,
}

impl DeviceLimits {
    #[cfg(target_os = "macos")]
    fn query(native: &NativeDevice) -> DeviceLimits {
        let (max_w, max_h, max_d) = native.max_threads_per_threadgroup();
        let max_alloc = native.max_buffer_length() as cl_ulong;

        DeviceLimits {
            device_type: CL_DEVICE_TYPE_GPU,
            vendor_id: 0x1027F00D,
            max_compute_units: 16,
            max_work_item_dimensions: 3,
            max_work_group_size: max_w,
            max_work_item_sizes: [max_w, max_h, max_d],
            max_mem_alloc_size: max_alloc,
            global_mem_size: native.working_set_size(),
            local_mem_size: 32 * 1024,
            max_parameter_size: 1024,
            max_samplers: 16,
            mem_base_addr_align: 1024,
            image_support: CL_TRUE,
            max_read_image_args: 32,
            max_write_image_args: 16,
            image2d_max_width: 16384,
            image2d_max_height: 16384,
            image3d_max_width: 2048,
            image3d_max_height: 2048,
            image3d_max_depth: 2048,
            max_constant_buffer_size: 64 * 1024,
            max_constant_args: 8,
            available: CL_TRUE,
            compiler_available: CL_TRUE,
            endian_little: CL_TRUE,
            name: native.name(),
            vendor: "Apple".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            profile: "FULL_PROFILE".to_string(),
            version: "OpenCL 1.2".to_string(),
            c_version: "OpenCL C 1.2".to_string(),
            extensions: "cl_khr_icd".to_string(),
        }
    }
}

#[repr(C)]
pub struct Device {
    base: ObjectBase,
    limits: DeviceLimits,
    #[cfg(target_os = "macos")]
    native: NativeDevice,
    #[cfg(target_os = "macos")]
    library_pool: LibraryPool,
}

impl ClObject for Device {
    const KIND: HandleKind = HandleKind::Device;
    const INVALID_HANDLE: cl_int = CL_INVALID_DEVICE;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

static DEVICE: OnceLock<Option<&'static Device>> = OnceLock::new();

impl Device {
    /// The process-wide device, or `CL_DEVICE_NOT_FOUND` when the system
    /// has no Metal GPU (or the platform has no Metal at all).
    pub fn get() -> ClResult<&'static Device> {
        DEVICE
            .get_or_init(|| {
                #[cfg(target_os = "macos")]
                {
                    let native = NativeDevice::new()?;
                    let limits = DeviceLimits::query(&native);
                    log::info!("using device '{}'", limits.name);
                    Some(&*Box::leak(Box::new(Device {
                        base: ObjectBase::new(HandleKind::Device),
                        limits,
                        native,
                        library_pool: LibraryPool::new(),
                    })))
                }
                #[cfg(not(target_os = "macos"))]
                {
                    None
                }
            })
            .ok_or(CL_DEVICE_NOT_FOUND)
    }

    pub fn is_available() -> bool {
        Device::get().is_ok()
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[cfg(target_os = "macos")]
    pub fn native(&self) -> &NativeDevice {
        &self.native
    }

    #[cfg(target_os = "macos")]
    pub fn library_pool(&self) -> &LibraryPool {
        &self.library_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::downcast;

    #[test]
    fn test_device_singleton_and_limits() {
        let Ok(device) = Device::get() else {
            println!("no device, skipping");
            return;
        };

        assert!(downcast::<Device>(device).is_ok());
        assert!(device.limits().max_work_group_size >= 1);
        assert_eq!(device.limits().max_work_item_dimensions, 3);
        assert!(device.limits().max_mem_alloc_size > 0);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_no_device_off_platform() {
        assert_eq!(Device::get().err(), Some(CL_DEVICE_NOT_FOUND));
    }
}
