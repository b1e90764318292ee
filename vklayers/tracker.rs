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

//! Per-device tables of buffers, images and memory allocations along
//! with the bindings between them. A buffer or image is bound to at
//! most one allocation at a time. A reverse index from each resource
//! to its current allocation is kept next to the binding lists so that
//! rebinding or destroying a resource doesn’t need to scan every
//! allocation.

use crate::extension_info::{BufferInfo, ImageBindInfo, ImageInfo, MemoryInfo};
use crate::registry::HandleMap;
use crate::vk;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct BufferRecord {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub flags: vk::BufferCreateFlags,
    /// The result of the most recent requirements query.
    pub requirements: vk::MemoryRequirements,
    pub info: BufferInfo,
}

impl BufferRecord {
    pub fn new(create_info: &vk::BufferCreateInfo, info: BufferInfo) -> BufferRecord {
        BufferRecord {
            size: create_info.size,
            usage: create_info.usage,
            flags: create_info.flags,
            requirements: Default::default(),
            info,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageRecord {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub requirements: vk::MemoryRequirements,
    pub info: ImageInfo,
}

impl ImageRecord {
    pub fn new(create_info: &vk::ImageCreateInfo, info: ImageInfo) -> ImageRecord {
        ImageRecord {
            image_type: create_info.image_type,
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
            tiling: create_info.tiling,
            usage: create_info.usage,
            flags: create_info.flags,
            requirements: Default::default(),
            info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBinding {
    pub image: vk::Image,
    pub offset: vk::DeviceSize,
    pub info: ImageBindInfo,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    pub allocation_size: vk::DeviceSize,
    pub memory_type_index: u32,
    /// Heap that the allocation was charged to, if it was charged to
    /// one at all.
    pub charged_heap: Option<usize>,
    pub info: MemoryInfo,
    /// Bound resources in the order they were bound.
    pub buffers: Vec<BufferBinding>,
    pub images: Vec<ImageBinding>,
}

impl MemoryRecord {
    pub fn new(allocate_info: &vk::MemoryAllocateInfo, info: MemoryInfo) -> MemoryRecord {
        MemoryRecord {
            allocation_size: allocate_info.allocation_size,
            memory_type_index: allocate_info.memory_type_index,
            charged_heap: None,
            info,
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }
}

/// Every tracked resource of one device.
#[derive(Debug, Default)]
pub struct ResourceTables {
    pub buffers: HandleMap<vk::Buffer, BufferRecord>,
    pub images: HandleMap<vk::Image, ImageRecord>,
    pub memories: HandleMap<vk::DeviceMemory, MemoryRecord>,

    buffer_bindings: HashMap<vk::Buffer, vk::DeviceMemory>,
    image_bindings: HashMap<vk::Image, vk::DeviceMemory>,

    /// Set whenever a binding changes and cleared once the change has
    /// been picked up after a queue submission.
    pub bindings_updated: bool,
}

impl ResourceTables {
    pub fn new() -> ResourceTables {
        ResourceTables::default()
    }

    pub fn add_buffer(&mut self, buffer: vk::Buffer, record: BufferRecord) {
        log::debug!("tracking {:?}", buffer);
        self.buffers.insert(buffer, record);
    }

    /// Forgets the buffer and removes it from whichever allocation it
    /// was bound to.
    pub fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.unbind_buffer(buffer);

        if self.buffers.erase(buffer).is_some() {
            log::debug!("forgot {:?}", buffer);
        }
    }

    pub fn add_image(&mut self, image: vk::Image, record: ImageRecord) {
        log::debug!("tracking {:?}", image);
        self.images.insert(image, record);
    }

    pub fn destroy_image(&mut self, image: vk::Image) {
        self.unbind_image(image);

        if self.images.erase(image).is_some() {
            log::debug!("forgot {:?}", image);
        }
    }

    pub fn add_memory(&mut self, memory: vk::DeviceMemory, record: MemoryRecord) {
        log::debug!(
            "tracking {:?} of {} bytes from type {}",
            memory,
            record.allocation_size,
            record.memory_type_index,
        );
        self.memories.insert(memory, record);
    }

    /// Forgets the allocation. The buffers and images that were bound
    /// to it stay tracked but are no longer bound to anything.
    pub fn free_memory(
        &mut self,
        memory: vk::DeviceMemory
    ) -> Option<MemoryRecord> {
        let record = self.memories.erase(memory)?;

        for binding in record.buffers.iter() {
            self.buffer_bindings.remove(&binding.buffer);
        }
        for binding in record.images.iter() {
            self.image_bindings.remove(&binding.image);
        }

        log::debug!("forgot {:?}", memory);

        Some(record)
    }

    pub fn set_buffer_requirements(
        &mut self,
        buffer: vk::Buffer,
        requirements: vk::MemoryRequirements,
    ) {
        match self.buffers.get_mut(buffer) {
            Some(record) => record.requirements = requirements,
            None => log::warn!("requirements for untracked {:?}", buffer),
        }
    }

    pub fn set_image_requirements(
        &mut self,
        image: vk::Image,
        requirements: vk::MemoryRequirements,
    ) {
        match self.images.get_mut(image) {
            Some(record) => record.requirements = requirements,
            None => log::warn!("requirements for untracked {:?}", image),
        }
    }

    /// Binds the buffer to `memory` at `offset`, replacing any previous
    /// binding. A null memory handle only removes the old binding.
    pub fn bind_buffer(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) {
        self.unbind_buffer(buffer);

        if memory != vk::DeviceMemory::null() {
            match self.memories.get_mut(memory) {
                Some(record) => {
                    record.buffers.push(BufferBinding { buffer, offset });
                    self.buffer_bindings.insert(buffer, memory);
                },
                None => log::warn!("{:?} bound to untracked {:?}", buffer, memory),
            }
        }

        self.bindings_updated = true;
    }

    pub fn bind_image(
        &mut self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        info: ImageBindInfo,
    ) {
        self.unbind_image(image);

        if memory != vk::DeviceMemory::null() {
            match self.memories.get_mut(memory) {
                Some(record) => {
                    record.images.push(ImageBinding { image, offset, info });
                    self.image_bindings.insert(image, memory);
                },
                None => log::warn!("{:?} bound to untracked {:?}", image, memory),
            }
        }

        self.bindings_updated = true;
    }

    fn unbind_buffer(&mut self, buffer: vk::Buffer) {
        let Some(memory) = self.buffer_bindings.remove(&buffer) else {
            return;
        };

        if let Some(record) = self.memories.get_mut(memory) {
            record.buffers.retain(|binding| binding.buffer != buffer);
        }
    }

    fn unbind_image(&mut self, image: vk::Image) {
        let Some(memory) = self.image_bindings.remove(&image) else {
            return;
        };

        if let Some(record) = self.memories.get_mut(memory) {
            record.images.retain(|binding| binding.image != image);
        }
    }

    pub fn buffer_memory(&self, buffer: vk::Buffer) -> Option<vk::DeviceMemory> {
        self.buffer_bindings.get(&buffer).copied()
    }

    pub fn image_memory(&self, image: vk::Image) -> Option<vk::DeviceMemory> {
        self.image_bindings.get(&image).copied()
    }

    /// Takes the “bindings updated” flag, clearing it.
    pub fn take_bindings_updated(&mut self) -> bool {
        std::mem::take(&mut self.bindings_updated)
    }
}
