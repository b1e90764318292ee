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

#![allow(non_camel_case_types)]

//! Vulkan types used by the layers. Everything from [ash::vk] is
//! re-exported here along with the loader/layer interface structures
//! from `vk_layer.h` which ash doesn’t provide.

pub use ash::vk::*;

use std::ffi::{c_char, c_void};

/// Value of the `function` member of the loader’s layer create-info
/// structures. This is kept as a plain integer because the loader
/// may pass values that this crate doesn’t know about.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFunction(pub i32);

impl LayerFunction {
    pub const LAYER_LINK_INFO: LayerFunction = LayerFunction(0);
    pub const LOADER_DATA_CALLBACK: LayerFunction = LayerFunction(1);
    pub const LOADER_LAYER_CREATE_DEVICE_CALLBACK: LayerFunction =
        LayerFunction(2);
    pub const LOADER_FEATURES: LayerFunction = LayerFunction(3);
}

pub type PFN_GetPhysicalDeviceProcAddr = unsafe extern "system" fn(
    instance: Instance,
    name: *const c_char,
) -> PFN_vkVoidFunction;

/// One node of the instance call chain. `VkLayerInstanceLink`.
#[repr(C)]
#[derive(Debug)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: Option<PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_physical_device_proc_addr:
        Option<PFN_GetPhysicalDeviceProcAddr>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerInstanceCreateInfoPayload {
    pub p_layer_info: *mut LayerInstanceLink,
    pub pfn_set_instance_loader_data: *const c_void,
    pub layer_device: [*const c_void; 2],
    pub loader_features: u32,
}

/// `VkLayerInstanceCreateInfo`, chained onto the
/// [InstanceCreateInfo] by the loader with the
/// [StructureType::LOADER_INSTANCE_CREATE_INFO] tag.
#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerInstanceCreateInfoPayload,
}

/// One node of the device call chain. `VkLayerDeviceLink`.
#[repr(C)]
#[derive(Debug)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: Option<PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_device_proc_addr: Option<PFN_vkGetDeviceProcAddr>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union LayerDeviceCreateInfoPayload {
    pub p_layer_info: *mut LayerDeviceLink,
    pub pfn_set_device_loader_data: *const c_void,
}

/// `VkLayerDeviceCreateInfo`, chained onto the [DeviceCreateInfo]
/// with the [StructureType::LOADER_DEVICE_CREATE_INFO] tag.
#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerDeviceCreateInfoPayload,
}

pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;

/// Highest version of the loader/layer interface that the layers
/// implement.
pub const CURRENT_LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

/// `VkNegotiateLayerInterface`, filled in by
/// `vkNegotiateLoaderLayerInterfaceVersion`.
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr:
        Option<PFN_GetPhysicalDeviceProcAddr>,
}
