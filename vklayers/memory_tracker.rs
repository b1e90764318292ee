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

//! The `VK_LAYER_LUNARG_memory_tracker` layer. It follows every
//! allocation, buffer and image of each device and writes a report of
//! the device’s memory when the device is created and after each
//! submission that follows a change of bindings.

use crate::extensions::DeviceExtensions;
use crate::layer::{
    self, lock, missing, proc_table, DeviceRecord, Layer, LayerState,
};
use crate::logger::Logger;
use crate::report::{write_report, ReportSource};
use crate::util::env_var_as_boolean;
use crate::vk;
use crate::vulkan_funcs::DeviceFuncs;
use std::ffi::c_char;
use std::fmt;
use std::mem::transmute;
use std::sync::OnceLock;

/// Set to false to only get the report when a device is created.
const DUMP_ON_SUBMIT_VAR: &str = "VK_MEMORY_TRACKER_DUMP_ON_SUBMIT";

const LOG_TARGET: &str = "memory_tracker";

pub struct MemoryTracker;

impl Layer for MemoryTracker {
    const LAYER_NAME: &'static str = "VK_LAYER_LUNARG_memory_tracker";
    const SPEC_VERSION: u32 = vk::make_api_version(0, 1, 0, 213);
    const IMPLEMENTATION_VERSION: u32 = 1;
    const DESCRIPTION: &'static str = "Layer: memory_tracker";

    const TOOL_NAME: &'static str = "Memory Tracker Layer";
    const TOOL_VERSION: &'static str = "1";
    const TOOL_PURPOSES: vk::ToolPurposeFlags = vk::ToolPurposeFlags::from_raw(
        vk::ToolPurposeFlags::TRACING.as_raw()
            | vk::ToolPurposeFlags::ADDITIONAL_FEATURES.as_raw()
    );
    const TOOL_DESCRIPTION: &'static str =
        "The VK_LAYER_LUNARG_memory_tracker layer tracks memory usage.";

    const TRACKED_EXTENSIONS: DeviceExtensions =
        DeviceExtensions::KHR_SYNCHRONIZATION_2
        .union(DeviceExtensions::KHR_EXTERNAL_MEMORY_FD)
        .union(DeviceExtensions::EXT_MEMORY_BUDGET)
        .union(DeviceExtensions::ANDROID_EXTERNAL_MEMORY_HARDWARE_BUFFER);

    const FORCE_MEMORY_BUDGET: bool = true;

    fn state() -> &'static LayerState {
        static STATE: OnceLock<LayerState> = OnceLock::new();

        STATE.get_or_init(LayerState::default)
    }

    fn device_commands(name: &[u8]) -> vk::PFN_vkVoidFunction {
        layer::shared_device_commands::<MemoryTracker>(name).or_else(|| {
            proc_table!(name => {
                b"vkGetImageSparseMemoryRequirements" =>
                    get_image_sparse_memory_requirements:
                    PFN_vkGetImageSparseMemoryRequirements,
            })
        })
    }

    fn device_extension_commands(
        enabled: DeviceExtensions,
        name: &[u8],
    ) -> vk::PFN_vkVoidFunction {
        if let func @ Some(_) =
            layer::shared_device_extension_commands::<MemoryTracker>(enabled, name)
        {
            return func;
        }

        if enabled.contains(DeviceExtensions::CORE_1_3) {
            let func = proc_table!(name => {
                b"vkGetDeviceBufferMemoryRequirements" =>
                    get_device_buffer_memory_requirements:
                    PFN_vkGetDeviceBufferMemoryRequirements,
                b"vkGetDeviceImageMemoryRequirements" =>
                    get_device_image_memory_requirements:
                    PFN_vkGetDeviceImageMemoryRequirements,
            });

            if func.is_some() {
                return func;
            }
        }

        if enabled.contains(DeviceExtensions::KHR_SYNCHRONIZATION_2) {
            let func = proc_table!(name => {
                b"vkGetDeviceBufferMemoryRequirementsKHR" =>
                    get_device_buffer_memory_requirements_khr:
                    PFN_vkGetDeviceBufferMemoryRequirements,
                b"vkGetDeviceImageMemoryRequirementsKHR" =>
                    get_device_image_memory_requirements_khr:
                    PFN_vkGetDeviceImageMemoryRequirements,
            });

            if func.is_some() {
                return func;
            }
        }

        None
    }

    fn device_created(device: &DeviceRecord) {
        dump_device(device);
    }

    fn submitted(device: &DeviceRecord, _fence: vk::Fence) {
        if device.refresh_after_submit()
            && env_var_as_boolean(DUMP_ON_SUBMIT_VAR, true)
        {
            dump_device(device);
        }
    }
}

/// Writes the memory report of one device. Only the allocations made
/// on this device are listed even if other devices share the physical
/// device. The instance map stays locked for the whole report so that
/// the instance can’t be torn down in the middle of it.
pub fn write_device_report<W: fmt::Write>(
    out: &mut W,
    device: &DeviceRecord,
) -> fmt::Result {
    let state = MemoryTracker::state();
    let _instances = lock(&state.instances);
    let device_name = device.physical_device.device_name();

    let physical_state = lock(&device.physical_device.state);
    let resources = lock(&device.resources);
    let external_fds = lock(&state.external_fds);
    let android_buffers = lock(&state.android_buffers);

    write_report(
        out,
        &ReportSource {
            device_name: &device_name,
            memory: &physical_state.memory,
            budget_supported: device.enabled.contains(
                DeviceExtensions::EXT_MEMORY_BUDGET
            ),
            resources: &resources,
            external_fds: &external_fds,
            android_buffers: &android_buffers,
        },
    )
}

fn dump_device(device: &DeviceRecord) {
    let mut logger = Logger::to_log(LOG_TARGET);

    if let Err(e) = write_device_report(&mut logger, device) {
        log::warn!("failed to write the memory report: {}", e);
    }
}

// Commands that are only passed through so that the layer shows up
// for them in the dispatch chain.

fn device_funcs(device: vk::Device) -> Option<DeviceFuncs> {
    MemoryTracker::state().device(device).map(|record| record.funcs)
}

unsafe extern "system" fn get_image_sparse_memory_requirements(
    device: vk::Device,
    image: vk::Image,
    p_sparse_memory_requirement_count: *mut u32,
    p_sparse_memory_requirements: *mut vk::SparseImageMemoryRequirements,
) {
    let get = device_funcs(device)
        .and_then(|funcs| funcs.vkGetImageSparseMemoryRequirements);

    match get {
        Some(get) => get(
            device,
            image,
            p_sparse_memory_requirement_count,
            p_sparse_memory_requirements,
        ),
        None => {
            missing("vkGetImageSparseMemoryRequirements");
        },
    }
}

unsafe fn device_buffer_requirements(
    device: vk::Device,
    p_info: *const vk::DeviceBufferMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
    khr: bool,
) {
    let get = device_funcs(device).and_then(|funcs| {
        let (first, second) = (
            funcs.vkGetDeviceBufferMemoryRequirements,
            funcs.vkGetDeviceBufferMemoryRequirementsKHR,
        );
        if khr { second.or(first) } else { first.or(second) }
    });

    match get {
        Some(get) => get(device, p_info, p_memory_requirements),
        None => {
            missing("vkGetDeviceBufferMemoryRequirements");
        },
    }
}

unsafe fn device_image_requirements(
    device: vk::Device,
    p_info: *const vk::DeviceImageMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
    khr: bool,
) {
    let get = device_funcs(device).and_then(|funcs| {
        let (first, second) = (
            funcs.vkGetDeviceImageMemoryRequirements,
            funcs.vkGetDeviceImageMemoryRequirementsKHR,
        );
        if khr { second.or(first) } else { first.or(second) }
    });

    match get {
        Some(get) => get(device, p_info, p_memory_requirements),
        None => {
            missing("vkGetDeviceImageMemoryRequirements");
        },
    }
}

unsafe extern "system" fn get_device_buffer_memory_requirements(
    device: vk::Device,
    p_info: *const vk::DeviceBufferMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    device_buffer_requirements(device, p_info, p_memory_requirements, false);
}

unsafe extern "system" fn get_device_buffer_memory_requirements_khr(
    device: vk::Device,
    p_info: *const vk::DeviceBufferMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    device_buffer_requirements(device, p_info, p_memory_requirements, true);
}

unsafe extern "system" fn get_device_image_memory_requirements(
    device: vk::Device,
    p_info: *const vk::DeviceImageMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    device_image_requirements(device, p_info, p_memory_requirements, false);
}

unsafe extern "system" fn get_device_image_memory_requirements_khr(
    device: vk::Device,
    p_info: *const vk::DeviceImageMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    device_image_requirements(device, p_info, p_memory_requirements, true);
}

// Entry points named in the layer manifest

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn memory_tracker_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_instance_proc_addr::<MemoryTracker>(instance, p_name)
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn memory_tracker_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_device_proc_addr::<MemoryTracker>(device, p_name)
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn memory_tracker_NegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut vk::NegotiateLayerInterface,
) -> vk::Result {
    layer::negotiate_loader_layer_interface_version::<MemoryTracker>(
        p_version_struct
    )
}
