// vklayers
//
// Copyright 2023 Neil Roberts
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// on the rights to use, copy, modify, merge, publish, distribute, sub
// license, and/or sell copies of the Software, and to permit persons to whom
// the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice (including the next
// paragraph) shall be included in all copies or substantial portions of the
// Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT.  IN NO EVENT SHALL
// VA LINUX SYSTEM, IBM AND/OR THEIR SUPPLIERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR
// OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE
// USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The extension structures that the layers understand when they are
//! chained onto a resource creation, a memory allocation or an image
//! bind. The chain is walked once and each recognised structure is
//! copied into a [ChainedPayload]. The payloads are then folded into
//! one of the “additional info” records, along with a set of flags
//! saying which of its fields were actually supplied.

use bitflags::bitflags;
use crate::chain;
use crate::util::slice_from_raw;
use crate::vk;
use std::ffi::c_void;

/// A copy of one recognised extension structure. Pointers that are
/// only kept for the report are stored as plain addresses so that the
/// records can be shared between threads.
#[derive(Debug, Clone)]
pub enum ChainedPayload {
    BufferOpaqueCaptureAddress(u64),
    ExternalMemoryBuffer(vk::ExternalMemoryHandleTypeFlags),
    BufferDeviceAddress(vk::DeviceAddress),
    ExternalMemoryImage(vk::ExternalMemoryHandleTypeFlags),
    ImageFormatList(Vec<vk::Format>),
    ImageStencilUsage(vk::ImageUsageFlags),
    ImageSwapchain(vk::SwapchainKHR),
    ImageCompressionControl {
        flags: vk::ImageCompressionFlagsEXT,
        fixed_rate_flags: Vec<vk::ImageCompressionFixedRateFlagsEXT>,
    },
    DrmFormatModifierExplicit {
        modifier: u64,
        plane_layouts: Vec<vk::SubresourceLayout>,
    },
    DrmFormatModifierList(Vec<u64>),
    ExternalFormatAndroid(u64),
    ExportMemory(vk::ExternalMemoryHandleTypeFlags),
    DedicatedAllocation {
        image: vk::Image,
        buffer: vk::Buffer,
    },
    MemoryAllocateFlags {
        flags: vk::MemoryAllocateFlags,
        device_mask: u32,
    },
    MemoryOpaqueCaptureAddress(u64),
    ImportMemoryFd {
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: i32,
    },
    ImportHostPointer {
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        host_pointer: usize,
    },
    MemoryPriority(f32),
    ImportAndroidHardwareBuffer(usize),
    BindImagePlane(vk::ImageAspectFlags),
    BindImageSwapchain {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
}

impl ChainedPayload {
    /// Copies the structure at `ptr` if its type is one that the
    /// layers know about.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid structure of type `s_type`.
    unsafe fn from_struct(
        s_type: vk::StructureType,
        ptr: *const c_void,
    ) -> Option<ChainedPayload> {
        let payload = match s_type {
            vk::StructureType::BUFFER_OPAQUE_CAPTURE_ADDRESS_CREATE_INFO => {
                let s = &*ptr.cast::<vk::BufferOpaqueCaptureAddressCreateInfo>();
                ChainedPayload::BufferOpaqueCaptureAddress(
                    s.opaque_capture_address
                )
            },
            vk::StructureType::EXTERNAL_MEMORY_BUFFER_CREATE_INFO => {
                let s = &*ptr.cast::<vk::ExternalMemoryBufferCreateInfo>();
                ChainedPayload::ExternalMemoryBuffer(s.handle_types)
            },
            vk::StructureType::BUFFER_DEVICE_ADDRESS_CREATE_INFO_EXT => {
                let s = &*ptr.cast::<vk::BufferDeviceAddressCreateInfoEXT>();
                ChainedPayload::BufferDeviceAddress(s.device_address)
            },
            vk::StructureType::EXTERNAL_MEMORY_IMAGE_CREATE_INFO => {
                let s = &*ptr.cast::<vk::ExternalMemoryImageCreateInfo>();
                ChainedPayload::ExternalMemoryImage(s.handle_types)
            },
            vk::StructureType::IMAGE_FORMAT_LIST_CREATE_INFO => {
                let s = &*ptr.cast::<vk::ImageFormatListCreateInfo>();
                ChainedPayload::ImageFormatList(
                    slice_from_raw(s.p_view_formats, s.view_format_count)
                        .to_vec()
                )
            },
            vk::StructureType::IMAGE_STENCIL_USAGE_CREATE_INFO => {
                let s = &*ptr.cast::<vk::ImageStencilUsageCreateInfo>();
                ChainedPayload::ImageStencilUsage(s.stencil_usage)
            },
            vk::StructureType::IMAGE_SWAPCHAIN_CREATE_INFO_KHR => {
                let s = &*ptr.cast::<vk::ImageSwapchainCreateInfoKHR>();
                ChainedPayload::ImageSwapchain(s.swapchain)
            },
            vk::StructureType::IMAGE_COMPRESSION_CONTROL_EXT => {
                let s = &*ptr.cast::<vk::ImageCompressionControlEXT>();
                ChainedPayload::ImageCompressionControl {
                    flags: s.flags,
                    fixed_rate_flags: slice_from_raw(
                        s.p_fixed_rate_flags.cast_const(),
                        s.compression_control_plane_count,
                    ).to_vec(),
                }
            },
            vk::StructureType::IMAGE_DRM_FORMAT_MODIFIER_EXPLICIT_CREATE_INFO_EXT => {
                let s = &*ptr
                    .cast::<vk::ImageDrmFormatModifierExplicitCreateInfoEXT>();
                ChainedPayload::DrmFormatModifierExplicit {
                    modifier: s.drm_format_modifier,
                    plane_layouts: slice_from_raw(
                        s.p_plane_layouts,
                        s.drm_format_modifier_plane_count,
                    ).to_vec(),
                }
            },
            vk::StructureType::IMAGE_DRM_FORMAT_MODIFIER_LIST_CREATE_INFO_EXT => {
                let s = &*ptr
                    .cast::<vk::ImageDrmFormatModifierListCreateInfoEXT>();
                ChainedPayload::DrmFormatModifierList(
                    slice_from_raw(
                        s.p_drm_format_modifiers,
                        s.drm_format_modifier_count,
                    ).to_vec()
                )
            },
            vk::StructureType::EXTERNAL_FORMAT_ANDROID => {
                let s = &*ptr.cast::<vk::ExternalFormatANDROID>();
                ChainedPayload::ExternalFormatAndroid(s.external_format)
            },
            vk::StructureType::EXPORT_MEMORY_ALLOCATE_INFO => {
                let s = &*ptr.cast::<vk::ExportMemoryAllocateInfo>();
                ChainedPayload::ExportMemory(s.handle_types)
            },
            vk::StructureType::MEMORY_DEDICATED_ALLOCATE_INFO => {
                let s = &*ptr.cast::<vk::MemoryDedicatedAllocateInfo>();
                ChainedPayload::DedicatedAllocation {
                    image: s.image,
                    buffer: s.buffer,
                }
            },
            vk::StructureType::MEMORY_ALLOCATE_FLAGS_INFO => {
                let s = &*ptr.cast::<vk::MemoryAllocateFlagsInfo>();
                ChainedPayload::MemoryAllocateFlags {
                    flags: s.flags,
                    device_mask: s.device_mask,
                }
            },
            vk::StructureType::MEMORY_OPAQUE_CAPTURE_ADDRESS_ALLOCATE_INFO => {
                let s = &*ptr
                    .cast::<vk::MemoryOpaqueCaptureAddressAllocateInfo>();
                ChainedPayload::MemoryOpaqueCaptureAddress(
                    s.opaque_capture_address
                )
            },
            vk::StructureType::IMPORT_MEMORY_FD_INFO_KHR => {
                let s = &*ptr.cast::<vk::ImportMemoryFdInfoKHR>();
                ChainedPayload::ImportMemoryFd {
                    handle_type: s.handle_type,
                    fd: s.fd,
                }
            },
            vk::StructureType::IMPORT_MEMORY_HOST_POINTER_INFO_EXT => {
                let s = &*ptr.cast::<vk::ImportMemoryHostPointerInfoEXT>();
                ChainedPayload::ImportHostPointer {
                    handle_type: s.handle_type,
                    host_pointer: s.p_host_pointer as usize,
                }
            },
            vk::StructureType::MEMORY_PRIORITY_ALLOCATE_INFO_EXT => {
                let s = &*ptr.cast::<vk::MemoryPriorityAllocateInfoEXT>();
                ChainedPayload::MemoryPriority(s.priority)
            },
            vk::StructureType::IMPORT_ANDROID_HARDWARE_BUFFER_INFO_ANDROID => {
                let s = &*ptr
                    .cast::<vk::ImportAndroidHardwareBufferInfoANDROID>();
                ChainedPayload::ImportAndroidHardwareBuffer(s.buffer as usize)
            },
            vk::StructureType::BIND_IMAGE_PLANE_MEMORY_INFO => {
                let s = &*ptr.cast::<vk::BindImagePlaneMemoryInfo>();
                ChainedPayload::BindImagePlane(s.plane_aspect)
            },
            vk::StructureType::BIND_IMAGE_MEMORY_SWAPCHAIN_INFO_KHR => {
                let s = &*ptr.cast::<vk::BindImageMemorySwapchainInfoKHR>();
                ChainedPayload::BindImageSwapchain {
                    swapchain: s.swapchain,
                    image_index: s.image_index,
                }
            },
            _ => return None,
        };

        Some(payload)
    }
}

/// Walks the chain once and copies every recognised structure in
/// order. Unknown structures are skipped.
///
/// # Safety
///
/// `p_next` must be null or a valid input structure chain.
pub unsafe fn collect_chain(p_next: *const c_void) -> Vec<ChainedPayload> {
    chain::iter_chain(p_next)
        .filter_map(|(s_type, ptr)| ChainedPayload::from_struct(s_type, ptr))
        .collect()
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferInfoFlags: u32 {
        const OPAQUE_CAPTURE_ADDRESS = 0x01;
        const EXTERNAL_MEMORY_HANDLE_TYPES = 0x02;
        const DEVICE_ADDRESS = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageInfoFlags: u32 {
        const EXTERNAL_MEMORY_HANDLE_TYPES = 0x01;
        const FORMAT_LIST = 0x02;
        const STENCIL_USAGE = 0x04;
        const SWAPCHAIN = 0x08;
        const COMPRESSION_CONTROL = 0x10;
        const DRM_FORMAT_MODIFIER_EXPLICIT = 0x20;
        const DRM_FORMAT_MODIFIER_LIST = 0x40;
        const EXTERNAL_FORMAT_ANDROID = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageBindInfoFlags: u32 {
        const PLANE_MEMORY = 0x01;
        const SWAPCHAIN = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryInfoFlags: u32 {
        const EXPORT = 0x01;
        const DEDICATED = 0x02;
        const ALLOCATE_FLAGS = 0x04;
        const OPAQUE_CAPTURE_ADDRESS = 0x08;
        const IMPORT_FD = 0x10;
        const IMPORT_HOST_POINTER = 0x20;
        const PRIORITY = 0x40;
        const ANDROID_HARDWARE_BUFFER = 0x80;
    }
}

/// Extra details captured when a buffer is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferInfo {
    pub flags: BufferInfoFlags,
    pub opaque_capture_address: u64,
    pub external_memory_handle_types: vk::ExternalMemoryHandleTypeFlags,
    pub device_address: vk::DeviceAddress,
}

impl BufferInfo {
    pub fn from_payloads<I>(payloads: I) -> BufferInfo
    where
        I: IntoIterator<Item = ChainedPayload>,
    {
        let mut info = BufferInfo::default();

        for payload in payloads {
            match payload {
                ChainedPayload::BufferOpaqueCaptureAddress(address) => {
                    info.flags |= BufferInfoFlags::OPAQUE_CAPTURE_ADDRESS;
                    info.opaque_capture_address = address;
                },
                ChainedPayload::ExternalMemoryBuffer(handle_types) => {
                    info.flags |= BufferInfoFlags::EXTERNAL_MEMORY_HANDLE_TYPES;
                    info.external_memory_handle_types = handle_types;
                },
                ChainedPayload::BufferDeviceAddress(address) => {
                    info.flags |= BufferInfoFlags::DEVICE_ADDRESS;
                    info.device_address = address;
                },
                _ => (),
            }
        }

        info
    }

    /// # Safety
    ///
    /// `create_info` must be a valid buffer create-info.
    pub unsafe fn from_create_info(
        create_info: &vk::BufferCreateInfo
    ) -> BufferInfo {
        BufferInfo::from_payloads(collect_chain(create_info.p_next))
    }
}

/// Extra details captured when an image is created.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub flags: ImageInfoFlags,
    pub external_memory_handle_types: vk::ExternalMemoryHandleTypeFlags,
    pub format_list: Vec<vk::Format>,
    pub stencil_usage: vk::ImageUsageFlags,
    pub swapchain: vk::SwapchainKHR,
    pub compression_flags: vk::ImageCompressionFlagsEXT,
    pub fixed_rate_flags: Vec<vk::ImageCompressionFixedRateFlagsEXT>,
    pub drm_format_modifier: u64,
    pub plane_layouts: Vec<vk::SubresourceLayout>,
    pub drm_format_modifiers: Vec<u64>,
    pub external_android_format: u64,
}

impl ImageInfo {
    pub fn from_payloads<I>(payloads: I) -> ImageInfo
    where
        I: IntoIterator<Item = ChainedPayload>,
    {
        let mut info = ImageInfo::default();

        for payload in payloads {
            match payload {
                ChainedPayload::ExternalMemoryImage(handle_types) => {
                    info.flags |= ImageInfoFlags::EXTERNAL_MEMORY_HANDLE_TYPES;
                    info.external_memory_handle_types = handle_types;
                },
                ChainedPayload::ImageFormatList(formats) => {
                    info.flags |= ImageInfoFlags::FORMAT_LIST;
                    info.format_list = formats;
                },
                ChainedPayload::ImageStencilUsage(usage) => {
                    info.flags |= ImageInfoFlags::STENCIL_USAGE;
                    info.stencil_usage = usage;
                },
                ChainedPayload::ImageSwapchain(swapchain) => {
                    info.flags |= ImageInfoFlags::SWAPCHAIN;
                    info.swapchain = swapchain;
                },
                ChainedPayload::ImageCompressionControl {
                    flags,
                    fixed_rate_flags,
                } => {
                    info.flags |= ImageInfoFlags::COMPRESSION_CONTROL;
                    info.compression_flags = flags;
                    info.fixed_rate_flags = fixed_rate_flags;
                },
                ChainedPayload::DrmFormatModifierExplicit {
                    modifier,
                    plane_layouts,
                } => {
                    info.flags |= ImageInfoFlags::DRM_FORMAT_MODIFIER_EXPLICIT;
                    info.drm_format_modifier = modifier;
                    info.plane_layouts = plane_layouts;
                },
                ChainedPayload::DrmFormatModifierList(modifiers) => {
                    info.flags |= ImageInfoFlags::DRM_FORMAT_MODIFIER_LIST;
                    info.drm_format_modifiers = modifiers;
                },
                ChainedPayload::ExternalFormatAndroid(format) => {
                    info.flags |= ImageInfoFlags::EXTERNAL_FORMAT_ANDROID;
                    info.external_android_format = format;
                },
                _ => (),
            }
        }

        info
    }

    /// # Safety
    ///
    /// `create_info` must be a valid image create-info.
    pub unsafe fn from_create_info(
        create_info: &vk::ImageCreateInfo
    ) -> ImageInfo {
        ImageInfo::from_payloads(collect_chain(create_info.p_next))
    }
}

/// Details chained onto one element of a `vkBindImageMemory2` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageBindInfo {
    pub flags: ImageBindInfoFlags,
    pub plane_aspect: vk::ImageAspectFlags,
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_image_index: u32,
}

impl ImageBindInfo {
    pub fn from_payloads<I>(payloads: I) -> ImageBindInfo
    where
        I: IntoIterator<Item = ChainedPayload>,
    {
        let mut info = ImageBindInfo::default();

        for payload in payloads {
            match payload {
                ChainedPayload::BindImagePlane(aspect) => {
                    info.flags |= ImageBindInfoFlags::PLANE_MEMORY;
                    info.plane_aspect = aspect;
                },
                ChainedPayload::BindImageSwapchain {
                    swapchain,
                    image_index,
                } => {
                    info.flags |= ImageBindInfoFlags::SWAPCHAIN;
                    info.swapchain = swapchain;
                    info.swapchain_image_index = image_index;
                },
                _ => (),
            }
        }

        info
    }

    /// # Safety
    ///
    /// `bind_info` must be a valid image bind info.
    pub unsafe fn from_bind_info(
        bind_info: &vk::BindImageMemoryInfo
    ) -> ImageBindInfo {
        ImageBindInfo::from_payloads(collect_chain(bind_info.p_next))
    }
}

/// Extra details captured when memory is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryInfo {
    pub flags: MemoryInfoFlags,
    pub export_handle_types: vk::ExternalMemoryHandleTypeFlags,
    pub dedicated_image: vk::Image,
    pub dedicated_buffer: vk::Buffer,
    pub allocate_flags: vk::MemoryAllocateFlags,
    pub device_mask: u32,
    pub opaque_capture_address: u64,
    pub import_fd_handle_type: vk::ExternalMemoryHandleTypeFlags,
    pub import_fd: i32,
    pub host_pointer_handle_type: vk::ExternalMemoryHandleTypeFlags,
    pub host_pointer: usize,
    pub priority: f32,
    pub android_hardware_buffer: usize,
}

impl MemoryInfo {
    pub fn from_payloads<I>(payloads: I) -> MemoryInfo
    where
        I: IntoIterator<Item = ChainedPayload>,
    {
        let mut info = MemoryInfo::default();

        for payload in payloads {
            match payload {
                ChainedPayload::ExportMemory(handle_types) => {
                    info.flags |= MemoryInfoFlags::EXPORT;
                    info.export_handle_types = handle_types;
                },
                ChainedPayload::DedicatedAllocation { image, buffer } => {
                    info.flags |= MemoryInfoFlags::DEDICATED;
                    info.dedicated_image = image;
                    info.dedicated_buffer = buffer;
                },
                ChainedPayload::MemoryAllocateFlags { flags, device_mask } => {
                    info.flags |= MemoryInfoFlags::ALLOCATE_FLAGS;
                    info.allocate_flags = flags;
                    info.device_mask = device_mask;
                },
                ChainedPayload::MemoryOpaqueCaptureAddress(address) => {
                    info.flags |= MemoryInfoFlags::OPAQUE_CAPTURE_ADDRESS;
                    info.opaque_capture_address = address;
                },
                ChainedPayload::ImportMemoryFd { handle_type, fd } => {
                    info.flags |= MemoryInfoFlags::IMPORT_FD;
                    info.import_fd_handle_type = handle_type;
                    info.import_fd = fd;
                },
                ChainedPayload::ImportHostPointer {
                    handle_type,
                    host_pointer,
                } => {
                    info.flags |= MemoryInfoFlags::IMPORT_HOST_POINTER;
                    info.host_pointer_handle_type = handle_type;
                    info.host_pointer = host_pointer;
                },
                ChainedPayload::MemoryPriority(priority) => {
                    info.flags |= MemoryInfoFlags::PRIORITY;
                    info.priority = priority;
                },
                ChainedPayload::ImportAndroidHardwareBuffer(buffer) => {
                    info.flags |= MemoryInfoFlags::ANDROID_HARDWARE_BUFFER;
                    info.android_hardware_buffer = buffer;
                },
                _ => (),
            }
        }

        info
    }

    /// # Safety
    ///
    /// `allocate_info` must be a valid memory allocate info.
    pub unsafe fn from_allocate_info(
        allocate_info: &vk::MemoryAllocateInfo
    ) -> MemoryInfo {
        MemoryInfo::from_payloads(collect_chain(allocate_info.p_next))
    }
}
