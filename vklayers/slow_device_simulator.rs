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

//! The `VK_LAYER_LUNARG_slow_device_simulator` layer. When any of its
//! settings is changed from the default it makes fences take longer
//! to complete and reports less memory than the device really has,
//! refusing allocations that wouldn’t fit in the smaller heaps.

use crate::budget::scale_memory_properties;
use crate::chain;
use crate::config::{EnvSettingsProvider, SimulatorConfig};
use crate::extensions::DeviceExtensions;
use crate::fence_delay::{plan_wait, FenceState, StatusDecision, WaitDecision};
use crate::layer::{
    self, lock, missing, proc_table, DeviceRecord, Layer, LayerState,
};
use crate::util::slice_from_raw;
use crate::vk::{self, Handle};
use std::ffi::c_char;
use std::mem::transmute;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

pub struct SlowDeviceSimulator;

impl Layer for SlowDeviceSimulator {
    const LAYER_NAME: &'static str = "VK_LAYER_LUNARG_slow_device_simulator";
    const SPEC_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);
    const IMPLEMENTATION_VERSION: u32 = 1;
    const DESCRIPTION: &'static str = "Layer: Slow Device Simulator";

    const TOOL_NAME: &'static str = "Slow Device Simulator Layer";
    const TOOL_VERSION: &'static str = "1";
    const TOOL_PURPOSES: vk::ToolPurposeFlags =
        vk::ToolPurposeFlags::MODIFYING_FEATURES;
    const TOOL_DESCRIPTION: &'static str =
        "The VK_LAYER_LUNARG_slow_device_simulator layer simulates slower devices.";

    const TRACKED_EXTENSIONS: DeviceExtensions =
        DeviceExtensions::KHR_SYNCHRONIZATION_2
        .union(DeviceExtensions::KHR_EXTERNAL_MEMORY_FD)
        .union(DeviceExtensions::EXT_MEMORY_BUDGET)
        .union(DeviceExtensions::ANDROID_EXTERNAL_MEMORY_HARDWARE_BUFFER)
        .union(DeviceExtensions::KHR_SWAPCHAIN)
        .union(DeviceExtensions::EXT_DISPLAY_CONTROL)
        .union(DeviceExtensions::EXT_SWAPCHAIN_MAINTENANCE_1);

    const FORCE_MEMORY_BUDGET: bool = false;

    fn state() -> &'static LayerState {
        static STATE: OnceLock<LayerState> = OnceLock::new();

        STATE.get_or_init(LayerState::default)
    }

    fn settings() -> SimulatorConfig {
        SimulatorConfig::from_provider(
            &EnvSettingsProvider::slow_device_simulator()
        )
    }

    fn device_commands(name: &[u8]) -> vk::PFN_vkVoidFunction {
        layer::shared_device_commands::<SlowDeviceSimulator>(name).or_else(|| {
            proc_table!(name => {
                b"vkQueueBindSparse" =>
                    queue_bind_sparse: PFN_vkQueueBindSparse,
                b"vkCreateFence" => create_fence: PFN_vkCreateFence,
                b"vkDestroyFence" => destroy_fence: PFN_vkDestroyFence,
                b"vkResetFences" => reset_fences: PFN_vkResetFences,
                b"vkGetFenceStatus" =>
                    get_fence_status: PFN_vkGetFenceStatus,
                b"vkWaitForFences" => wait_for_fences: PFN_vkWaitForFences,
            })
        })
    }

    fn device_extension_commands(
        enabled: DeviceExtensions,
        name: &[u8],
    ) -> vk::PFN_vkVoidFunction {
        if let func @ Some(_) = layer::shared_device_extension_commands::<
            SlowDeviceSimulator
        >(enabled, name)
        {
            return func;
        }

        if enabled.contains(DeviceExtensions::KHR_SWAPCHAIN) {
            let func = proc_table!(name => {
                b"vkAcquireNextImageKHR" =>
                    acquire_next_image: PFN_vkAcquireNextImageKHR,
                b"vkAcquireNextImage2KHR" =>
                    acquire_next_image2: PFN_vkAcquireNextImage2KHR,
                b"vkQueuePresentKHR" => queue_present: PFN_vkQueuePresentKHR,
            });

            if func.is_some() {
                return func;
            }
        }

        if enabled.contains(DeviceExtensions::EXT_DISPLAY_CONTROL) {
            let func = proc_table!(name => {
                b"vkRegisterDeviceEventEXT" =>
                    register_device_event: PFN_vkRegisterDeviceEventEXT,
                b"vkRegisterDisplayEventEXT" =>
                    register_display_event: PFN_vkRegisterDisplayEventEXT,
            });

            if func.is_some() {
                return func;
            }
        }

        None
    }

    fn adjust_memory_properties(
        config: &SimulatorConfig,
        props: &mut vk::PhysicalDeviceMemoryProperties,
        budget: Option<&mut vk::PhysicalDeviceMemoryBudgetPropertiesEXT>,
    ) {
        if config.layer_enabled() && config.memory_percent < 100 {
            scale_memory_properties(props, budget, config.memory_percent);
        }
    }

    fn submitted(device: &DeviceRecord, fence: vk::Fence) {
        signal_fence(device, fence);
        device.refresh_after_submit();
    }
}

fn device_record(device: vk::Device) -> Option<Arc<DeviceRecord>> {
    SlowDeviceSimulator::state().device(device)
}

fn queue_record(queue: vk::Queue) -> Option<Arc<DeviceRecord>> {
    SlowDeviceSimulator::state().queue_device(queue)
}

/// Notes that a queue operation will signal the fence. Fences are only
/// tracked while the simulator is enabled.
fn signal_fence(device: &DeviceRecord, fence: vk::Fence) {
    if !device.config.layer_enabled() || fence.is_null() {
        return;
    }

    if let Some(state) = lock(&device.fences).get_mut(fence) {
        state.signal(Instant::now());
    }
}

fn track_fence(device: &DeviceRecord, fence: vk::Fence, state: FenceState) {
    lock(&device.fences).insert(fence, state);
}

fn new_fence_state(config: &SimulatorConfig, signalled: bool) -> FenceState {
    FenceState::new(
        signalled,
        config.fence_delay_type,
        config.fence_delay_count,
        Instant::now(),
    )
}

// Fences

unsafe extern "system" fn create_fence(
    device: vk::Device,
    p_create_info: *const vk::FenceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(create) = record.funcs.vkCreateFence else {
        return missing("vkCreateFence");
    };

    let res = create(device, p_create_info, p_allocator, p_fence);

    if res == vk::Result::SUCCESS && record.config.layer_enabled() {
        let signalled = p_create_info.as_ref().is_some_and(|info| {
            info.flags.contains(vk::FenceCreateFlags::SIGNALED)
        });

        track_fence(&record, *p_fence, new_fence_state(&record.config, signalled));
    }

    res
}

unsafe extern "system" fn destroy_fence(
    device: vk::Device,
    fence: vk::Fence,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(record) = device_record(device) else {
        return;
    };

    match record.funcs.vkDestroyFence {
        Some(destroy) => destroy(device, fence, p_allocator),
        None => {
            missing("vkDestroyFence");
        },
    }

    lock(&record.fences).erase(fence);
}

unsafe extern "system" fn reset_fences(
    device: vk::Device,
    fence_count: u32,
    p_fences: *const vk::Fence,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(reset) = record.funcs.vkResetFences else {
        return missing("vkResetFences");
    };

    let res = reset(device, fence_count, p_fences);

    if res == vk::Result::SUCCESS {
        let mut fences = lock(&record.fences);

        for &fence in slice_from_raw(p_fences, fence_count) {
            if let Some(state) = fences.get_mut(fence) {
                state.reset();
            }
        }
    }

    res
}

unsafe extern "system" fn get_fence_status(
    device: vk::Device,
    fence: vk::Fence,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(get) = record.funcs.vkGetFenceStatus else {
        return missing("vkGetFenceStatus");
    };

    let decision = lock(&record.fences)
        .get_mut(fence)
        .map(|state| state.query_status(Instant::now()));

    if decision == Some(StatusDecision::NotReady) {
        return vk::Result::NOT_READY;
    }

    get(device, fence)
}

unsafe extern "system" fn wait_for_fences(
    device: vk::Device,
    fence_count: u32,
    p_fences: *const vk::Fence,
    wait_all: vk::Bool32,
    timeout: u64,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(wait) = record.funcs.vkWaitForFences else {
        return missing("vkWaitForFences");
    };

    if !record.config.layer_enabled() {
        return wait(device, fence_count, p_fences, wait_all, timeout);
    }

    let decision = {
        let mut tracked = lock(&record.fences);

        // Work on copies so that a fence listed twice doesn’t need two
        // mutable borrows of the same entry
        let mut states = slice_from_raw(p_fences, fence_count)
            .iter()
            .map(|&fence| (fence, tracked.get(fence).copied()))
            .collect::<Vec<_>>();

        let decision = plan_wait(
            &mut states
                .iter_mut()
                .map(|(fence, state)| (*fence, state.as_mut()))
                .collect::<Vec<_>>(),
            wait_all != vk::FALSE,
            timeout,
            Instant::now(),
        );

        for (fence, state) in states {
            if let (Some(state), Some(entry)) = (state, tracked.get_mut(fence)) {
                *entry = state;
            }
        }

        decision
    };

    match decision {
        WaitDecision::Timeout => vk::Result::TIMEOUT,
        WaitDecision::Forward { fences, sleep, timeout } => {
            if !sleep.is_zero() {
                log::debug!(
                    "{}: delaying fence wait by {:?}",
                    SlowDeviceSimulator::LAYER_NAME,
                    sleep,
                );
                thread::sleep(sleep);
            }

            wait(device, fences.len() as u32, fences.as_ptr(), wait_all, timeout)
        },
    }
}

// Operations that signal a fence

unsafe extern "system" fn queue_bind_sparse(
    queue: vk::Queue,
    bind_info_count: u32,
    p_bind_info: *const vk::BindSparseInfo,
    fence: vk::Fence,
) -> vk::Result {
    let Some(record) = queue_record(queue) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(bind) = record.funcs.vkQueueBindSparse else {
        return missing("vkQueueBindSparse");
    };

    signal_fence(&record, fence);

    bind(queue, bind_info_count, p_bind_info, fence)
}

unsafe extern "system" fn acquire_next_image(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(acquire) = record.funcs.vkAcquireNextImageKHR else {
        return missing("vkAcquireNextImageKHR");
    };

    signal_fence(&record, fence);

    acquire(device, swapchain, timeout, semaphore, fence, p_image_index)
}

unsafe extern "system" fn acquire_next_image2(
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(acquire) = record.funcs.vkAcquireNextImage2KHR else {
        return missing("vkAcquireNextImage2KHR");
    };

    if let Some(info) = p_acquire_info.as_ref() {
        signal_fence(&record, info.fence);
    }

    acquire(device, p_acquire_info, p_image_index)
}

unsafe extern "system" fn queue_present(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    let Some(record) = queue_record(queue) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(present) = record.funcs.vkQueuePresentKHR else {
        return missing("vkQueuePresentKHR");
    };

    let res = present(queue, p_present_info);

    // A suboptimal present still signals its fences
    if !matches!(res, vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR)
        || !record.enabled.contains(DeviceExtensions::EXT_SWAPCHAIN_MAINTENANCE_1)
    {
        return res;
    }

    let Some(present_info) = p_present_info.as_ref() else {
        return res;
    };

    for (s_type, ptr) in chain::iter_chain(present_info.p_next) {
        if s_type != vk::StructureType::SWAPCHAIN_PRESENT_FENCE_INFO_EXT {
            continue;
        }

        let fence_info = &*ptr.cast::<vk::SwapchainPresentFenceInfoEXT>();

        for &fence in slice_from_raw(fence_info.p_fences, fence_info.swapchain_count) {
            signal_fence(&record, fence);
        }
    }

    res
}

/// Fences made for events are tracked as if the registration
/// triggered them.
fn track_event_fence(record: &DeviceRecord, fence: vk::Fence) {
    if !record.config.layer_enabled() {
        return;
    }

    let mut state = new_fence_state(&record.config, false);
    state.signal(Instant::now());

    track_fence(record, fence, state);
}

unsafe extern "system" fn register_device_event(
    device: vk::Device,
    p_device_event_info: *const vk::DeviceEventInfoEXT,
    p_allocator: *const vk::AllocationCallbacks,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(register) = record.funcs.vkRegisterDeviceEventEXT else {
        return missing("vkRegisterDeviceEventEXT");
    };

    let res = register(device, p_device_event_info, p_allocator, p_fence);

    if res == vk::Result::SUCCESS {
        track_event_fence(&record, *p_fence);
    }

    res
}

unsafe extern "system" fn register_display_event(
    device: vk::Device,
    display: vk::DisplayKHR,
    p_display_event_info: *const vk::DisplayEventInfoEXT,
    p_allocator: *const vk::AllocationCallbacks,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    let Some(record) = device_record(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(register) = record.funcs.vkRegisterDisplayEventEXT else {
        return missing("vkRegisterDisplayEventEXT");
    };

    let res = register(
        device,
        display,
        p_display_event_info,
        p_allocator,
        p_fence,
    );

    if res == vk::Result::SUCCESS {
        track_event_fence(&record, *p_fence);
    }

    res
}

// Entry points named in the layer manifest

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn slow_device_simulator_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_instance_proc_addr::<SlowDeviceSimulator>(instance, p_name)
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn slow_device_simulator_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    layer::get_device_proc_addr::<SlowDeviceSimulator>(device, p_name)
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn slow_device_simulator_NegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut vk::NegotiateLayerInterface,
) -> vk::Result {
    layer::negotiate_loader_layer_interface_version::<SlowDeviceSimulator>(
        p_version_struct
    )
}
