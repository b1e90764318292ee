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

//! Helpers to walk the `pNext` extension structure chains and to pick
//! the loader’s link info out of the instance and device create-info
//! chains.

use crate::error::LayerError;
use crate::vk;
use std::ffi::c_void;
use std::marker::PhantomData;

/// Iterator over an input extension chain. Each item is the
/// structure type and a pointer to the start of the structure.
pub struct ChainIter<'a> {
    next: *const vk::BaseInStructure<'a>,
    _marker: PhantomData<&'a ()>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (vk::StructureType, *const c_void);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }

        // SAFETY: the caller of iter_chain promised that every
        // pointer in the chain is a valid Vulkan structure
        let base = unsafe { &*self.next };
        let item = (base.s_type, self.next.cast::<c_void>());

        self.next = base.p_next;

        Some(item)
    }
}

/// Walks an input structure chain starting at `p_next`.
///
/// # Safety
///
/// `p_next` must be null or the start of a valid chain of Vulkan
/// structures that outlives the iterator.
pub unsafe fn iter_chain<'a>(p_next: *const c_void) -> ChainIter<'a> {
    ChainIter {
        next: p_next.cast(),
        _marker: PhantomData,
    }
}

/// Finds the first structure with the given type in an input chain.
///
/// # Safety
///
/// Same as [iter_chain]. `T` must be the structure that corresponds
/// to `s_type`.
pub unsafe fn find_in_chain<'a, T>(
    p_next: *const c_void,
    s_type: vk::StructureType,
) -> Option<&'a T> {
    iter_chain(p_next)
        .find(|&(t, _)| t == s_type)
        .map(|(_, ptr)| &*ptr.cast::<T>())
}

/// Finds the first structure with the given type in an output chain
/// so that it can be written to.
///
/// # Safety
///
/// Same as [find_in_chain] and the chain must be writable.
pub unsafe fn find_in_chain_mut<'a, T>(
    p_next: *mut c_void,
    s_type: vk::StructureType,
) -> Option<&'a mut T> {
    let mut next = p_next.cast::<vk::BaseOutStructure>();

    while let Some(base) = next.as_mut() {
        if base.s_type == s_type {
            return Some(&mut *next.cast::<T>());
        }

        next = base.p_next;
    }

    None
}

/// Finds the loader’s instance link info, reads the next layer’s
/// `vkGetInstanceProcAddr` from it and then advances the link so that
/// the next layer will see its own entry when it is called.
///
/// # Safety
///
/// `create_info` must be a valid instance create-info built by the
/// loader.
pub unsafe fn take_instance_link(
    create_info: *const vk::InstanceCreateInfo,
) -> Result<vk::PFN_vkGetInstanceProcAddr, LayerError> {
    let create_info = create_info.as_ref().ok_or(LayerError::MissingLinkInfo)?;

    let link_info = iter_chain(create_info.p_next)
        .filter(|&(s_type, _)| {
            s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO
        })
        .map(|(_, ptr)| ptr as *mut vk::LayerInstanceCreateInfo)
        .find(|&ptr| (*ptr).function == vk::LayerFunction::LAYER_LINK_INFO)
        .ok_or(LayerError::MissingLinkInfo)?;

    let layer_info = (*link_info).u.p_layer_info
        .as_ref()
        .ok_or(LayerError::MissingLinkInfo)?;
    let gipa = layer_info.pfn_next_get_instance_proc_addr
        .ok_or(LayerError::MissingFunction("vkGetInstanceProcAddr"))?;

    (*link_info).u.p_layer_info = layer_info.p_next;

    Ok(gipa)
}

/// The next layer’s resolvers taken from a device link.
#[derive(Clone, Copy)]
pub struct DeviceLink {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

/// Same as [take_instance_link] but for device creation.
///
/// # Safety
///
/// `create_info` must be a valid device create-info built by the
/// loader.
pub unsafe fn take_device_link(
    create_info: *const vk::DeviceCreateInfo,
) -> Result<DeviceLink, LayerError> {
    let create_info = create_info.as_ref().ok_or(LayerError::MissingLinkInfo)?;

    let link_info = iter_chain(create_info.p_next)
        .filter(|&(s_type, _)| {
            s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO
        })
        .map(|(_, ptr)| ptr as *mut vk::LayerDeviceCreateInfo)
        .find(|&ptr| (*ptr).function == vk::LayerFunction::LAYER_LINK_INFO)
        .ok_or(LayerError::MissingLinkInfo)?;

    let layer_info = (*link_info).u.p_layer_info
        .as_ref()
        .ok_or(LayerError::MissingLinkInfo)?;
    let link = DeviceLink {
        get_instance_proc_addr: layer_info.pfn_next_get_instance_proc_addr
            .ok_or(LayerError::MissingFunction("vkGetInstanceProcAddr"))?,
        get_device_proc_addr: layer_info.pfn_next_get_device_proc_addr
            .ok_or(LayerError::MissingFunction("vkGetDeviceProcAddr"))?,
    };

    (*link_info).u.p_layer_info = layer_info.p_next;

    Ok(link)
}
