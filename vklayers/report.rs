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

//! Text report of a device’s memory. For each heap it lists the
//! sizes and flags and then, for each memory type using the heap,
//! every allocation with the buffers and images bound to it.

use crate::budget::MemoryTable;
use crate::extension_info::{BufferInfoFlags, ImageInfoFlags, MemoryInfoFlags};
use crate::registry::HandleMap;
use crate::tracker::{MemoryRecord, ResourceTables};
use crate::vk::{self, Handle};
use std::fmt;

/// Where an imported external memory object came from, recorded when
/// its properties are queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalMemoryRecord {
    pub device: vk::Device,
    pub memory_type_bits: u32,
    pub allocation_size: vk::DeviceSize,
}

/// Everything the report needs. The caller is responsible for holding
/// the locks that keep it consistent.
pub struct ReportSource<'a> {
    pub device_name: &'a str,
    pub memory: &'a MemoryTable,
    pub budget_supported: bool,
    pub resources: &'a ResourceTables,
    pub external_fds: &'a HandleMap<i32, ExternalMemoryRecord>,
    pub android_buffers: &'a HandleMap<usize, ExternalMemoryRecord>,
}

static HEAP_FLAG_NAMES: [(vk::MemoryHeapFlags, &str); 2] = [
    (vk::MemoryHeapFlags::DEVICE_LOCAL, "DEVICE_LOCAL"),
    (vk::MemoryHeapFlags::MULTI_INSTANCE, "MULTI_INSTANCE"),
];

static TYPE_FLAG_NAMES: [(vk::MemoryPropertyFlags, &str); 9] = [
    (vk::MemoryPropertyFlags::DEVICE_LOCAL, "DEVICE_LOCAL"),
    (vk::MemoryPropertyFlags::HOST_VISIBLE, "HOST_VISIBLE"),
    (vk::MemoryPropertyFlags::HOST_COHERENT, "HOST_COHERENT"),
    (vk::MemoryPropertyFlags::HOST_CACHED, "HOST_CACHED"),
    (vk::MemoryPropertyFlags::LAZILY_ALLOCATED, "LAZY_ALLOC"),
    (vk::MemoryPropertyFlags::PROTECTED, "PROTECTED"),
    (vk::MemoryPropertyFlags::DEVICE_COHERENT_AMD, "DEV_COHERENT_AMD"),
    (vk::MemoryPropertyFlags::DEVICE_UNCACHED_AMD, "DEV_UNCACHED_AMD"),
    (vk::MemoryPropertyFlags::RDMA_CAPABLE_NV, "RDMA_CAPABLE_NV"),
];

const BLANK: &str = "  |                                          |";

pub fn write_report<W: fmt::Write>(
    out: &mut W,
    source: &ReportSource,
) -> fmt::Result {
    writeln!(out, "Device : {}", source.device_name)?;

    // Sort the allocations so that the report is stable
    let mut memories = source.resources.memories.iter().collect::<Vec<_>>();
    memories.sort_by_key(|(memory, _)| memory.as_raw());

    for (heap_index, heap) in source.memory.heaps.iter().enumerate() {
        writeln!(out, "  -----Heap {:02}-------------------------------", heap_index)?;
        writeln!(out, "  |    Total Size {:14}             |", heap.size)?;

        if source.budget_supported {
            writeln!(out, "  |    Budget     {:14}             |", heap.budget)?;
            writeln!(out, "  |    Usage      {:14}             |", heap.usage)?;
        }

        writeln!(out, "  |    Flags                                 |")?;

        for (flag, name) in HEAP_FLAG_NAMES.iter() {
            if heap.flags.contains(*flag) {
                writeln!(out, "  |      {:<36}|", name)?;
            }
        }

        for (type_index, memory_type) in source.memory.types.iter().enumerate() {
            if memory_type.heap_index as usize != heap_index {
                continue;
            }

            writeln!(out, "{}", BLANK)?;
            writeln!(out, "  |   ---Type {:02}---                          |", type_index)?;
            writeln!(out, "  |     Flags                                |")?;

            if memory_type.property_flags.is_empty() {
                writeln!(out, "  |        <No Flags>                        |")?;
            }

            for (flag, name) in TYPE_FLAG_NAMES.iter() {
                if memory_type.property_flags.contains(*flag) {
                    writeln!(out, "  |        {:<34}|", name)?;
                }
            }

            let allocations = memories
                .iter()
                .filter(|(_, record)| record.memory_type_index as usize == type_index);

            for (i, (memory, record)) in allocations.enumerate() {
                if i == 0 {
                    writeln!(out, "{}", BLANK)?;
                    writeln!(out, "  |     Allocated Memory                     |")?;
                    writeln!(out, "  |     -------------------                  |")?;
                } else {
                    writeln!(out, "  |        -------                           |")?;
                }

                write_allocation(out, source, *memory, record)?;
            }
        }

        writeln!(out, "{}", BLANK)?;
        writeln!(out, "  -------------------------------------------")?;
    }

    Ok(())
}

fn write_allocation<W: fmt::Write>(
    out: &mut W,
    source: &ReportSource,
    memory: vk::DeviceMemory,
    record: &MemoryRecord,
) -> fmt::Result {
    writeln!(out, "  |        VkMemory    {:16x}      |", memory.as_raw())?;
    writeln!(out, "  |          Size          {:12}      |", record.allocation_size)?;

    let info = &record.info;

    if info.flags.contains(MemoryInfoFlags::EXPORT) {
        writeln!(
            out,
            "  |          Ext_Mem_Flags 0x{:08x}       |",
            info.export_handle_types.as_raw(),
        )?;
    }
    if info.flags.contains(MemoryInfoFlags::DEDICATED) {
        if info.dedicated_image != vk::Image::null() {
            writeln!(
                out,
                "  |          Dedic Img {:16x}      |",
                info.dedicated_image.as_raw(),
            )?;
        }
        if info.dedicated_buffer != vk::Buffer::null() {
            writeln!(
                out,
                "  |          Dedic Buf {:16x}      |",
                info.dedicated_buffer.as_raw(),
            )?;
        }
    }
    if info.flags.contains(MemoryInfoFlags::ALLOCATE_FLAGS) {
        writeln!(
            out,
            "  |          Alloc Flags 0x{:08x} Mask 0x{:08x} |",
            info.allocate_flags.as_raw(),
            info.device_mask,
        )?;
    }
    if info.flags.contains(MemoryInfoFlags::OPAQUE_CAPTURE_ADDRESS) {
        writeln!(
            out,
            "  |          Opaque Capt Addr {:16x}   |",
            info.opaque_capture_address,
        )?;
    }
    if info.flags.contains(MemoryInfoFlags::IMPORT_FD) {
        writeln!(
            out,
            "  |          Extern Mem Fd HandleType   0x{:08x}   |",
            info.import_fd_handle_type.as_raw(),
        )?;
        writeln!(out, "  |          Extern Mem Fd {:16x}   |", info.import_fd)?;

        if let Some(fd) = source.external_fds.get(info.import_fd) {
            writeln!(
                out,
                "  |             MemoryTypes     0x{:08x}   |",
                fd.memory_type_bits,
            )?;
        }
    }
    if info.flags.contains(MemoryInfoFlags::IMPORT_HOST_POINTER) {
        writeln!(
            out,
            "  |          Import Host Ptr HandleType    0x{:08x}   |",
            info.host_pointer_handle_type.as_raw(),
        )?;
        writeln!(out, "  |          Import Host Ptr {:16x}   |", info.host_pointer)?;
    }
    if info.flags.contains(MemoryInfoFlags::PRIORITY) {
        writeln!(out, "  |          Priority {:10.6}                |", info.priority)?;
    }
    if info.flags.contains(MemoryInfoFlags::ANDROID_HARDWARE_BUFFER) {
        writeln!(
            out,
            "  |          AHardwareBuffer {:16x}   |",
            info.android_hardware_buffer,
        )?;

        if let Some(buffer) = source.android_buffers.get(info.android_hardware_buffer) {
            writeln!(
                out,
                "  |             AllocSize      {:12}   |",
                buffer.allocation_size,
            )?;
            writeln!(
                out,
                "  |             MemoryTypes     0x{:08x}   |",
                buffer.memory_type_bits,
            )?;
        }
    }

    writeln!(out, "{}", BLANK)?;

    for (i, binding) in record.buffers.iter().enumerate() {
        if i == 0 {
            writeln!(out, "  |          Bound Buffers                   |")?;
            writeln!(out, "  |          .....................           |")?;
        } else {
            writeln!(out, "  |             ..........                   |")?;
        }

        writeln!(out, "  |             VkBuffer {:16x}    |", binding.buffer.as_raw())?;

        let Some(buffer) = source.resources.buffers.get(binding.buffer) else {
            continue;
        };

        write_requirements(out, &buffer.requirements, binding.offset)?;

        let info = &buffer.info;

        if info.flags.contains(BufferInfoFlags::OPAQUE_CAPTURE_ADDRESS) {
            writeln!(
                out,
                "  |                 Opaque Capt Addr {:16} |",
                info.opaque_capture_address,
            )?;
        }
        if info.flags.contains(BufferInfoFlags::EXTERNAL_MEMORY_HANDLE_TYPES) {
            writeln!(
                out,
                "  |                 Ext Mem Flags    0x{:08x}  |",
                info.external_memory_handle_types.as_raw(),
            )?;
        }
        if info.flags.contains(BufferInfoFlags::DEVICE_ADDRESS) {
            writeln!(
                out,
                "  |                 Device Addr {:16x} |",
                info.device_address,
            )?;
        }
    }

    for (i, binding) in record.images.iter().enumerate() {
        if i == 0 {
            writeln!(out, "  |          Bound Images                    |")?;
            writeln!(out, "  |          .....................           |")?;
        } else {
            writeln!(out, "  |             ..........                   |")?;
        }

        writeln!(out, "  |             VkImage  {:16x}    |", binding.image.as_raw())?;

        let Some(image) = source.resources.images.get(binding.image) else {
            continue;
        };

        write_requirements(out, &image.requirements, binding.offset)?;
        write_image_info(out, image)?;
    }

    Ok(())
}

fn write_requirements<W: fmt::Write>(
    out: &mut W,
    requirements: &vk::MemoryRequirements,
    offset: vk::DeviceSize,
) -> fmt::Result {
    writeln!(out, "  |                 Size     {:12}    |", requirements.size)?;
    writeln!(out, "  |                 Align    {:12}    |", requirements.alignment)?;
    writeln!(out, "  |                 Offset   {:12}    |", offset)?;
    writeln!(
        out,
        "  |                 Flags      0x{:08x}    |",
        requirements.memory_type_bits,
    )
}

fn write_image_info<W: fmt::Write>(
    out: &mut W,
    image: &crate::tracker::ImageRecord,
) -> fmt::Result {
    let info = &image.info;

    if info.flags.contains(ImageInfoFlags::EXTERNAL_MEMORY_HANDLE_TYPES) {
        writeln!(
            out,
            "  |                 Ext Mem Flags    0x{:08x}  |",
            info.external_memory_handle_types.as_raw(),
        )?;
    }
    if info.flags.contains(ImageInfoFlags::FORMAT_LIST) {
        for (i, format) in info.format_list.iter().enumerate() {
            let label = if i == 0 { "Valid Formats" } else { "" };
            writeln!(
                out,
                "  |                 {:<17}0x{:08x}  |",
                label,
                format.as_raw(),
            )?;
        }
    }
    if info.flags.contains(ImageInfoFlags::STENCIL_USAGE) {
        writeln!(
            out,
            "  |                 Stencil Flags    0x{:08x}  |",
            info.stencil_usage.as_raw(),
        )?;
    }
    if info.flags.contains(ImageInfoFlags::SWAPCHAIN) {
        writeln!(
            out,
            "  |                 Swapchain {:16x} |",
            info.swapchain.as_raw(),
        )?;
    }
    if info.flags.contains(ImageInfoFlags::COMPRESSION_CONTROL) {
        writeln!(
            out,
            "  |                 Compress Flags      0x{:08x} |",
            info.compression_flags.as_raw(),
        )?;
        for (i, flags) in info.fixed_rate_flags.iter().enumerate() {
            let label = if i == 0 { "Fixed Rate Flags" } else { "" };
            writeln!(
                out,
                "  |                 {:<20}0x{:08x} |",
                label,
                flags.as_raw(),
            )?;
        }
    }
    if info.flags.contains(ImageInfoFlags::DRM_FORMAT_MODIFIER_EXPLICIT) {
        writeln!(
            out,
            "  |                 Drm Format Mod {:16} |",
            info.drm_format_modifier,
        )?;
        writeln!(out, "  |                 Drm Planes                        |")?;
        for layout in info.plane_layouts.iter() {
            writeln!(out, "  |                           Offs     {:14} |", layout.offset)?;
            writeln!(out, "  |                           Size     {:14} |", layout.size)?;
        }
    }
    if info.flags.contains(ImageInfoFlags::DRM_FORMAT_MODIFIER_LIST) {
        for (i, modifier) in info.drm_format_modifiers.iter().enumerate() {
            let label = if i == 0 { "Drm Format Mods" } else { "" };
            writeln!(out, "  |                 {:<18}{:14} |", label, modifier)?;
        }
    }
    if info.flags.contains(ImageInfoFlags::EXTERNAL_FORMAT_ANDROID) {
        writeln!(
            out,
            "  |                 Ext Android Fmt   {:14x} |",
            info.external_android_format,
        )?;
    }

    Ok(())
}
