//! Image format support — (channel order, channel type) → native pixel
//! format, element sizes, and the supported-format table contexts hand out.

use crate::cl::*;

#[cfg(target_os = "macos")]
use objc2_metal::MTLPixelFormat;

/// Formats the driver can realize as Metal textures. Order matters only
/// for the supported-format query, which reports the table as-is.
const SUPPORTED: &[(cl_channel_order, cl_channel_type)] = &[
    (CL_R, CL_UNORM_INT8),
    (CL_R, CL_SNORM_INT8),
    (CL_R, CL_SIGNED_INT8),
    (CL_R, CL_UNSIGNED_INT8),
    (CL_R, CL_UNORM_INT16),
    (CL_R, CL_SIGNED_INT16),
    (CL_R, CL_UNSIGNED_INT16),
    (CL_R, CL_HALF_FLOAT),
    (CL_R, CL_SIGNED_INT32),
    (CL_R, CL_UNSIGNED_INT32),
    (CL_R, CL_FLOAT),
    (CL_RG, CL_UNORM_INT8),
    (CL_RG, CL_SNORM_INT8),
    (CL_RG, CL_SIGNED_INT8),
    (CL_RG, CL_UNSIGNED_INT8),
    (CL_RG, CL_UNORM_INT16),
    (CL_RG, CL_SIGNED_INT16),
    (CL_RG, CL_UNSIGNED_INT16),
    (CL_RG, CL_HALF_FLOAT),
    (CL_RG, CL_SIGNED_INT32),
    (CL_RG, CL_UNSIGNED_INT32),
    (CL_RG, CL_FLOAT),
    (CL_RGBA, CL_UNORM_INT8),
    (CL_RGBA, CL_SNORM_INT8),
    (CL_RGBA, CL_SIGNED_INT8),
    (CL_RGBA, CL_UNSIGNED_INT8),
    (CL_RGBA, CL_UNORM_INT16),
    (CL_RGBA, CL_SIGNED_INT16),
    (CL_RGBA, CL_UNSIGNED_INT16),
    (CL_RGBA, CL_HALF_FLOAT),
    (CL_RGBA, CL_SIGNED_INT32),
    (CL_RGBA, CL_UNSIGNED_INT32),
    (CL_RGBA, CL_FLOAT),
    (CL_BGRA, CL_UNORM_INT8),
];

/// The format list a context reports to clients.
pub fn supported_formats() -> Vec<cl_image_format> {
    SUPPORTED
        .iter()
        .map(|&(order, ty)| cl_image_format {
            image_channel_order: order,
            image_channel_data_type: ty,
        })
        .collect()
}

pub fn is_supported(format: &cl_image_format) -> bool {
    SUPPORTED
        .iter()
        .any(|&(o, t)| o == format.image_channel_order && t == format.image_channel_data_type)
}

pub fn channel_count(order: cl_channel_order) -> usize {
    match order {
        CL_R | CL_A => 1,
        CL_RG => 2,
        CL_RGBA | CL_BGRA => 4,
        _ => 0,
    }
}

pub fn channel_size(ty: cl_channel_type) -> usize {
    match ty {
        CL_SNORM_INT8 | CL_UNORM_INT8 | CL_SIGNED_INT8 | CL_UNSIGNED_INT8 => 1,
        CL_SNORM_INT16 | CL_UNORM_INT16 | CL_SIGNED_INT16 | CL_UNSIGNED_INT16 | CL_HALF_FLOAT => 2,
        CL_SIGNED_INT32 | CL_UNSIGNED_INT32 | CL_FLOAT => 4,
        _ => 0,
    }
}

/// Bytes per pixel for a supported format.
pub fn element_size(format: &cl_image_format) -> usize {
    channel_count(format.image_channel_order) * channel_size(format.image_channel_data_type)
}

/// Map a supported format to its Metal pixel format.
#[cfg(target_os = "macos")]
pub fn pixel_format(format: &cl_image_format) -> Option<MTLPixelFormat> {
    let f = match (format.image_channel_order, format.image_channel_data_type) {
        (CL_R, CL_UNORM_INT8) => MTLPixelFormat::R8Unorm,
        (CL_R, CL_SNORM_INT8) => MTLPixelFormat::R8Snorm,
        (CL_R, CL_SIGNED_INT8) => MTLPixelFormat::R8Sint,
        (CL_R, CL_UNSIGNED_INT8) => MTLPixelFormat::R8Uint,
        (CL_R, CL_UNORM_INT16) => MTLPixelFormat::R16Unorm,
        (CL_R, CL_SIGNED_INT16) => MTLPixelFormat::R16Sint,
        (CL_R, CL_UNSIGNED_INT16) => MTLPixelFormat::R16Uint,
        (CL_R, CL_HALF_FLOAT) => MTLPixelFormat::R16Float,
        (CL_R, CL_SIGNED_INT32) => MTLPixelFormat::R32Sint,
        (CL_R, CL_UNSIGNED_INT32) => MTLPixelFormat::R32Uint,
        (CL_R, CL_FLOAT) => MTLPixelFormat::R32Float,
        (CL_RG, CL_UNORM_INT8) => MTLPixelFormat::RG8Unorm,
        (CL_RG, CL_SNORM_INT8) => MTLPixelFormat::RG8Snorm,
        (CL_RG, CL_SIGNED_INT8) => MTLPixelFormat::RG8Sint,
        (CL_RG, CL_UNSIGNED_INT8) => MTLPixelFormat::RG8Uint,
        (CL_RG, CL_UNORM_INT16) => MTLPixelFormat::RG16Unorm,
        (CL_RG, CL_SIGNED_INT16) => MTLPixelFormat::RG16Sint,
        (CL_RG, CL_UNSIGNED_INT16) => MTLPixelFormat::RG16Uint,
        (CL_RG, CL_HALF_FLOAT) => MTLPixelFormat::RG16Float,
        (CL_RG, CL_SIGNED_INT32) => MTLPixelFormat::RG32Sint,
        (CL_RG, CL_UNSIGNED_INT32) => MTLPixelFormat::RG32Uint,
        (CL_RG, CL_FLOAT) => MTLPixelFormat::RG32Float,
        (CL_RGBA, CL_UNORM_INT8) => MTLPixelFormat::RGBA8Unorm,
        (CL_RGBA, CL_SNORM_INT8) => MTLPixelFormat::RGBA8Snorm,
        (CL_RGBA, CL_SIGNED_INT8) => MTLPixelFormat::RGBA8Sint,
        (CL_RGBA, CL_UNSIGNED_INT8) => MTLPixelFormat::RGBA8Uint,
        (CL_RGBA, CL_UNORM_INT16) => MTLPixelFormat::RGBA16Unorm,
        (CL_RGBA, CL_SIGNED_INT16) => MTLPixelFormat::RGBA16Sint,
        (CL_RGBA, CL_UNSIGNED_INT16) => MTLPixelFormat::RGBA16Uint,
        (CL_RGBA, CL_HALF_FLOAT) => MTLPixelFormat::RGBA16Float,
        (CL_RGBA, CL_SIGNED_INT32) => MTLPixelFormat::RGBA32Sint,
        (CL_RGBA, CL_UNSIGNED_INT32) => MTLPixelFormat::RGBA32Uint,
        (CL_RGBA, CL_FLOAT) => MTLPixelFormat::RGBA32Float,
        (CL_BGRA, CL_UNORM_INT8) => MTLPixelFormat::BGRA8Unorm,
        _ => return None,
    };
    Some(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_supported_format_has_a_size() {
        for f in supported_formats() {
            assert!(element_size(&f) > 0, "format {:?} has zero size", f);
        }
    }

    #[test]
    fn test_element_sizes() {
        let rgba8 = cl_image_format {
            image_channel_order: CL_RGBA,
            image_channel_data_type: CL_UNORM_INT8,
        };
        let r32f = cl_image_format {
            image_channel_order: CL_R,
            image_channel_data_type: CL_FLOAT,
        };
        let rgba32i = cl_image_format {
            image_channel_order: CL_RGBA,
            image_channel_data_type: CL_SIGNED_INT32,
        };
        assert_eq!(element_size(&rgba8), 4);
        assert_eq!(element_size(&r32f), 4);
        assert_eq!(element_size(&rgba32i), 16);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let luminance = cl_image_format {
            image_channel_order: 0x10B9,
            image_channel_data_type: CL_FLOAT,
        };
        assert!(!is_supported(&luminance));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_supported_formats_map_to_metal() {
        for f in supported_formats() {
            assert!(pixel_format(&f).is_some(), "format {:?} unmapped", f);
        }
    }
}
