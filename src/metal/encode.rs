//! Segment encoding — command records → one Metal command buffer.
//!
//! Transfers ride a blit encoder; adjacent transfer records share one
//! encoder pass, and a dispatch or barrier closes it. Host writes go in
//! through shared staging buffers created at encode time; host reads come
//! out through staging plus a deferred memcpy the completion worker runs
//! after the buffer retires. The command buffer retains every referenced
//! resource, so staging buffers may drop out of scope once encoded.

use std::ffi::c_void;
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSRange;
use objc2_metal::{
    MTLBlitCommandEncoder, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder,
    MTLComputeCommandEncoder, MTLOrigin, MTLSize,
};

use crate::cl::*;
use crate::geom::{Origin, Size};
use crate::queue::{pitched_copy_bytes, Command, DispatchCall, EncodedArg, HostPtr};

use super::buffer_ops::RawBuffer;
use super::device_init::{NativeDevice, NativeQueue};

type BlitEncoder = Retained<ProtocolObject<dyn MTLBlitCommandEncoder>>;
type CommandBufferRef = ProtocolObject<dyn MTLCommandBuffer>;

/// A staging buffer whose contents reach the host after retirement.
struct DeferredRead {
    staging: RawBuffer,
    dst: HostPtr,
    len: usize,
}

struct SendCommandBuffer(Retained<CommandBufferRef>);

unsafe impl Send for SendCommandBuffer {}
unsafe impl Sync for SendCommandBuffer {}

/// One encoded segment, ready to commit and retire.
pub struct EncodedBatch {
    buffer: SendCommandBuffer,
    deferred: Vec<DeferredRead>,
}

impl EncodedBatch {
    pub fn commit(&self) {
        self.buffer.0.commit();
    }

    /// Block until the device finishes; true when the buffer errored.
    pub fn wait_until_completed(&self) -> bool {
        self.buffer.0.waitUntilCompleted();
        self.buffer.0.status() == MTLCommandBufferStatus::Error
    }

    /// Copy staged read results out to their host destinations.
    pub fn perform_deferred_reads(&self) {
        for read in &self.deferred {
            let src = read.staging.contents();
            if src.is_null() {
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(src, read.dst.0, read.len);
            }
        }
    }
}

fn mtl_size(size: &Size) -> MTLSize {
    MTLSize {
        width: size.w,
        height: size.h,
        depth: size.d,
    }
}

fn mtl_origin(origin: &Origin) -> MTLOrigin {
    MTLOrigin {
        x: origin.x,
        y: origin.y,
        z: origin.z,
    }
}

fn blit_encoder<'a>(
    command_buffer: &CommandBufferRef,
    blit: &'a mut Option<BlitEncoder>,
) -> ClResult<&'a BlitEncoder> {
    if blit.is_none() {
        *blit = Some(
            command_buffer
                .blitCommandEncoder()
                .ok_or(CL_OUT_OF_RESOURCES)?,
        );
    }
    blit.as_ref().ok_or(CL_OUT_OF_RESOURCES)
}

fn end_blit(blit: &mut Option<BlitEncoder>) {
    if let Some(encoder) = blit.take() {
        encoder.endEncoding();
    }
}

/// Encode a segment's commands into a fresh command buffer.
pub fn encode(
    device: &NativeDevice,
    queue: &NativeQueue,
    commands: &[Command],
) -> ClResult<EncodedBatch> {
    let command_buffer = queue.command_buffer().ok_or(CL_OUT_OF_RESOURCES)?;
    let mut blit: Option<BlitEncoder> = None;
    let mut deferred: Vec<DeferredRead> = Vec::new();

    for command in commands {
        match command {
            Command::ReadBuffer {
                src,
                offset,
                size,
                dst,
            } => {
                let (raw, origin) = src.raw_buffer()?;
                let staging =
                    RawBuffer::allocate(device, *size).ok_or(CL_OUT_OF_RESOURCES)?;
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                        &raw.buffer,
                        origin + offset,
                        &staging.buffer,
                        0,
                        *size,
                    );
                }
                deferred.push(DeferredRead {
                    staging,
                    dst: HostPtr(dst.0),
                    len: *size,
                });
            }
            Command::WriteBuffer { dst, offset, data } => {
                let (raw, origin) = dst.raw_buffer()?;
                let staging = RawBuffer::from_bytes(device, data.as_ptr(), data.len())
                    .ok_or(CL_OUT_OF_RESOURCES)?;
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                        &staging.buffer,
                        0,
                        &raw.buffer,
                        origin + offset,
                        data.len(),
                    );
                }
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let (src_raw, src_origin) = src.raw_buffer()?;
                let (dst_raw, dst_origin) = dst.raw_buffer()?;
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                        &src_raw.buffer,
                        src_origin + src_offset,
                        &dst_raw.buffer,
                        dst_origin + dst_offset,
                        *size,
                    );
                }
            }
            Command::FillBuffer {
                dst,
                offset,
                size,
                pattern,
            } => {
                let (raw, origin) = dst.raw_buffer()?;
                if pattern.len() == 1 {
                    let encoder = blit_encoder(&command_buffer, &mut blit)?;
                    unsafe {
                        encoder.fillBuffer_range_value(
                            &raw.buffer,
                            NSRange {
                                location: origin + offset,
                                length: *size,
                            },
                            pattern[0],
                        );
                    }
                } else {
                    let mut bytes = vec![0u8; *size];
                    for chunk in bytes.chunks_mut(pattern.len()) {
                        chunk.copy_from_slice(&pattern[..chunk.len()]);
                    }
                    let staging = RawBuffer::from_bytes(device, bytes.as_ptr(), bytes.len())
                        .ok_or(CL_OUT_OF_RESOURCES)?;
                    let encoder = blit_encoder(&command_buffer, &mut blit)?;
                    unsafe {
                        encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                            &staging.buffer,
                            0,
                            &raw.buffer,
                            origin + offset,
                            *size,
                        );
                    }
                }
            }
            Command::ReadImage {
                src,
                origin,
                region,
                row_pitch,
                slice_pitch,
                dst,
            } => {
                let texture = src.raw_texture()?;
                let element = src.image_element_size()?;
                let len = pitched_copy_bytes(region, *row_pitch, *slice_pitch, element)?;
                let staging = RawBuffer::allocate(device, len).ok_or(CL_OUT_OF_RESOURCES)?;
                let bytes_per_image = if region.d > 1 { *slice_pitch } else { 0 };
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder
                        .copyFromTexture_sourceSlice_sourceLevel_sourceOrigin_sourceSize_toBuffer_destinationOffset_destinationBytesPerRow_destinationBytesPerImage(
                            &texture.texture,
                            0,
                            0,
                            mtl_origin(origin),
                            mtl_size(region),
                            &staging.buffer,
                            0,
                            *row_pitch,
                            bytes_per_image,
                        );
                }
                deferred.push(DeferredRead {
                    staging,
                    dst: HostPtr(dst.0),
                    len,
                });
            }
            Command::WriteImage {
                dst,
                origin,
                region,
                row_pitch,
                slice_pitch,
                data,
            } => {
                let texture = dst.raw_texture()?;
                let staging = RawBuffer::from_bytes(device, data.as_ptr(), data.len())
                    .ok_or(CL_OUT_OF_RESOURCES)?;
                let bytes_per_image = if region.d > 1 { *slice_pitch } else { 0 };
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder
                        .copyFromBuffer_sourceOffset_sourceBytesPerRow_sourceBytesPerImage_sourceSize_toTexture_destinationSlice_destinationLevel_destinationOrigin(
                            &staging.buffer,
                            0,
                            *row_pitch,
                            bytes_per_image,
                            mtl_size(region),
                            &texture.texture,
                            0,
                            0,
                            mtl_origin(origin),
                        );
                }
            }
            Command::CopyImage {
                src,
                src_origin,
                dst,
                dst_origin,
                region,
            } => {
                let src_texture = src.raw_texture()?;
                let dst_texture = dst.raw_texture()?;
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder
                        .copyFromTexture_sourceSlice_sourceLevel_sourceOrigin_sourceSize_toTexture_destinationSlice_destinationLevel_destinationOrigin(
                            &src_texture.texture,
                            0,
                            0,
                            mtl_origin(src_origin),
                            mtl_size(region),
                            &dst_texture.texture,
                            0,
                            0,
                            mtl_origin(dst_origin),
                        );
                }
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                dst_origin,
                region,
            } => {
                let (raw, origin) = src.raw_buffer()?;
                let texture = dst.raw_texture()?;
                let element = dst.image_element_size()?;
                let row = region.w * element;
                let bytes_per_image = if region.d > 1 { row * region.h } else { 0 };
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder
                        .copyFromBuffer_sourceOffset_sourceBytesPerRow_sourceBytesPerImage_sourceSize_toTexture_destinationSlice_destinationLevel_destinationOrigin(
                            &raw.buffer,
                            origin + src_offset,
                            row,
                            bytes_per_image,
                            mtl_size(region),
                            &texture.texture,
                            0,
                            0,
                            mtl_origin(dst_origin),
                        );
                }
            }
            Command::CopyImageToBuffer {
                src,
                src_origin,
                region,
                dst,
                dst_offset,
            } => {
                let texture = src.raw_texture()?;
                let (raw, origin) = dst.raw_buffer()?;
                let element = src.image_element_size()?;
                let row = region.w * element;
                let bytes_per_image = if region.d > 1 { row * region.h } else { 0 };
                let encoder = blit_encoder(&command_buffer, &mut blit)?;
                unsafe {
                    encoder
                        .copyFromTexture_sourceSlice_sourceLevel_sourceOrigin_sourceSize_toBuffer_destinationOffset_destinationBytesPerRow_destinationBytesPerImage(
                            &texture.texture,
                            0,
                            0,
                            mtl_origin(src_origin),
                            mtl_size(region),
                            &raw.buffer,
                            origin + dst_offset,
                            row,
                            bytes_per_image,
                        );
                }
            }
            Command::Dispatch(call) => {
                end_blit(&mut blit);
                encode_dispatch(&command_buffer, call)?;
            }
            Command::Barrier => {
                // An encoder boundary is the strongest ordering Metal
                // needs within one in-order command buffer.
                end_blit(&mut blit);
            }
        }
    }

    end_blit(&mut blit);
    Ok(EncodedBatch {
        buffer: SendCommandBuffer(command_buffer),
        deferred,
    })
}

fn encode_dispatch(command_buffer: &CommandBufferRef, call: &DispatchCall) -> ClResult<()> {
    let encoder = command_buffer
        .computeCommandEncoder()
        .ok_or(CL_OUT_OF_RESOURCES)?;

    encoder.setComputePipelineState(&call.pipeline.pipeline);

    for arg in &call.args {
        match arg {
            EncodedArg::Bytes { slot, data } => unsafe {
                encoder.setBytes_length_atIndex(
                    NonNull::new_unchecked(data.as_ptr() as *mut c_void),
                    data.len(),
                    *slot as usize,
                );
            },
            EncodedArg::Buffer { slot, memory } => match memory {
                Some(memory) => {
                    let (raw, origin) = memory.raw_buffer()?;
                    unsafe {
                        encoder.setBuffer_offset_atIndex(
                            Some(&raw.buffer),
                            origin,
                            *slot as usize,
                        );
                    }
                }
                None => unsafe {
                    encoder.setBuffer_offset_atIndex(None, 0, *slot as usize);
                },
            },
            EncodedArg::Image { slot, memory } => {
                let texture = memory.raw_texture()?;
                unsafe {
                    encoder.setTexture_atIndex(Some(&texture.texture), *slot as usize);
                }
            }
            EncodedArg::Sampler { slot, sampler } => unsafe {
                encoder.setSamplerState_atIndex(Some(sampler.native_state()), *slot as usize);
            },
        }
    }

    encoder.dispatchThreadgroups_threadsPerThreadgroup(
        mtl_size(&call.groups),
        mtl_size(&call.local),
    );
    encoder.endEncoding();
    Ok(())
}
