//! Metal device initialization.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::{MTLCommandBuffer, MTLCommandQueue, MTLCreateSystemDefaultDevice, MTLDevice};

// MTLCreateSystemDefaultDevice requires CoreGraphics to be linked
#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {}

/// The system GPU. Metal devices are thread-safe; the wrapper carries the
/// Send/Sync promise the generated protocol object cannot.
pub struct NativeDevice {
    pub device: Retained<ProtocolObject<dyn MTLDevice>>,
}

unsafe impl Send for NativeDevice {}
unsafe impl Sync for NativeDevice {}

impl NativeDevice {
    /// Acquire the system default device.
    pub fn new() -> Option<Self> {
        let device = MTLCreateSystemDefaultDevice()?;
        Some(NativeDevice { device })
    }

    /// Check if Metal is available on this system.
    pub fn is_available() -> bool {
        MTLCreateSystemDefaultDevice().is_some()
    }

    pub fn name(&self) -> String {
        self.device.name().to_string()
    }

    /// Upper bound on threads per threadgroup, per dimension.
    pub fn max_threads_per_threadgroup(&self) -> (usize, usize, usize) {
        let size = self.device.maxThreadsPerThreadgroup();
        (size.width, size.height, size.depth)
    }

    /// Largest single buffer allocation the device accepts.
    pub fn max_buffer_length(&self) -> usize {
        self.device.maxBufferLength()
    }

    /// Memory budget the device recommends staying under.
    pub fn working_set_size(&self) -> u64 {
        self.device.recommendedMaxWorkingSetSize()
    }
}

/// A native command stream. One per driver command queue.
pub struct NativeQueue {
    pub queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
}

unsafe impl Send for NativeQueue {}
unsafe impl Sync for NativeQueue {}

impl NativeQueue {
    pub fn new(device: &NativeDevice) -> Option<Self> {
        let queue = device.device.newCommandQueue()?;
        Some(NativeQueue { queue })
    }

    pub fn command_buffer(
        &self,
    ) -> Option<Retained<ProtocolObject<dyn MTLCommandBuffer>>> {
        self.queue.commandBuffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_creation() {
        if !NativeDevice::is_available() {
            println!("Metal not available, skipping");
            return;
        }

        let device = NativeDevice::new().expect("failed to create Metal device");
        assert!(!device.name().is_empty());
        assert!(device.max_buffer_length() > 0);

        let queue = NativeQueue::new(&device);
        assert!(queue.is_some());
    }
}
