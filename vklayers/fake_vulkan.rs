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

//! Sets up a fake Vulkan driver that sits below a layer in the tests.
//! It can be manipulated to report different devices and extensions
//! and to fail specific calls. This is only built in test
//! configurations.
//!
//! The layers keep their shadow state in process-wide maps that are
//! shared by every test thread. The fake therefore hands out handles
//! from a global counter so that no two tests ever see the same one.

use crate::chain;
use crate::layer::{self, Layer};
use crate::util::{copy_to_c_array, copy_with_count, slice_from_raw};
use crate::vk::{self, Handle as _};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, c_int, CStr, CString};
use std::marker::PhantomData;
use std::mem::transmute;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

// Pointer to the current FakeVulkan instance that was created in
// this thread. There can only be one instance per thread.
thread_local! {
    static CURRENT_FAKE_VULKAN: Cell<Option<*mut FakeVulkan>> = Cell::new(None);
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x1000);

pub const HEAP_SIZE: vk::DeviceSize = 1 << 30;
pub const HEAP_BUDGET: vk::DeviceSize = 768 << 20;
pub const HEAP_USAGE: vk::DeviceSize = 64 << 20;

/// A structure containing the physical device infos that will be
/// reported by the driver.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub heap_budget: [vk::DeviceSize; vk::MAX_MEMORY_HEAPS],
    pub heap_usage: [vk::DeviceSize; vk::MAX_MEMORY_HEAPS],
    pub extensions: Vec<vk::ExtensionProperties>,
}

impl PhysicalDeviceInfo {
    pub fn add_extension(&mut self, ext: &CStr) {
        let mut props = vk::ExtensionProperties {
            spec_version: 1,
            ..Default::default()
        };

        copy_to_c_array(&mut props.extension_name, &ext.to_string_lossy());

        self.extensions.push(props);
    }
}

impl Default for PhysicalDeviceInfo {
    fn default() -> PhysicalDeviceInfo {
        let mut properties = vk::PhysicalDeviceProperties {
            api_version: vk::make_api_version(0, 1, 3, 0),
            vendor_id: 0xfa4eed,
            device_id: 0xfa4ede,
            device_type: vk::PhysicalDeviceType::VIRTUAL_GPU,
            ..Default::default()
        };
        copy_to_c_array(&mut properties.device_name, "Fake Vulkan Device");

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 1,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: HEAP_SIZE,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };

        let mut heap_budget = [0; vk::MAX_MEMORY_HEAPS];
        let mut heap_usage = [0; vk::MAX_MEMORY_HEAPS];
        heap_budget[0] = HEAP_BUDGET;
        heap_usage[0] = HEAP_USAGE;

        PhysicalDeviceInfo {
            properties,
            memory_properties,
            heap_budget,
            heap_usage,
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum HandleType {
    Instance,
    PhysicalDevice(usize),
    Device { queue: vk::Queue },
    Queue,
    Buffer,
    Image,
    Memory { size: vk::DeviceSize },
    Fence {
        signalled: bool,
        reset_count: usize,
        status_count: usize,
    },
}

#[derive(Debug)]
pub struct Handle {
    pub freed: bool,
    pub data: HandleType,
}

/// A fake Vulkan driver. Note that there can only be one FakeVulkan
/// instance per-thread because it needs to use thread-local storage
/// to figure out the current fake driver when one of its functions is
/// called. The FakeVulkan should always be stored in a box so that
/// its address can be tracked in [CURRENT_FAKE_VULKAN].
#[derive(Debug)]
pub struct FakeVulkan {
    pub physical_devices: Vec<PhysicalDeviceInfo>,

    /// Tools that the driver itself reports
    pub tools: Vec<&'static str>,

    // The requirements returned by vkGetBufferMemoryRequirements and
    // vkGetImageMemoryRequirements.
    pub memory_requirements: vk::MemoryRequirements,

    /// The extensions that were passed to the last vkCreateDevice
    pub enabled_device_extensions: Vec<CString>,

    /// The fences and timeout of each call to vkWaitForFences
    pub fence_waits: Vec<(Vec<vk::Fence>, u64)>,

    /// Number of memory property queries that had the budget chained
    pub budget_queries: usize,

    /// Number of calls to vkAllocateMemory that reached the driver
    pub allocation_count: usize,

    physical_device_handles: Vec<vk::PhysicalDevice>,

    handles: HashMap<u64, Handle>,

    // Queue of values to return instead of VK_SUCCESS to simulate
    // function call failures. This is indexed by the function name
    // and the value is a queue of override values to return.
    result_queue: HashMap<String, VecDeque<vk::Result>>,
}

macro_rules! fake_fn {
    ($ty:ident, $func:expr) => {
        unsafe { transmute::<vk::$ty, unsafe extern "system" fn()>($func) }
    };
}

impl FakeVulkan {
    pub fn new() -> Box<FakeVulkan> {
        let mut fake_vulkan = Box::new(FakeVulkan {
            physical_devices: vec![PhysicalDeviceInfo::default()],
            tools: Vec::new(),
            memory_requirements: vk::MemoryRequirements {
                size: 1024,
                alignment: 256,
                memory_type_bits: 0b11,
            },
            enabled_device_extensions: Vec::new(),
            fence_waits: Vec::new(),
            budget_queries: 0,
            allocation_count: 0,
            physical_device_handles: Vec::new(),
            handles: HashMap::new(),
            result_queue: HashMap::new(),
        });

        CURRENT_FAKE_VULKAN.with(|f| {
            let old_value = f.replace(Some(
                fake_vulkan.as_mut() as *mut FakeVulkan
            ));

            // There can only be one FakeVulkan instance per thread at a time
            assert!(old_value.is_none());
        });

        fake_vulkan
    }

    pub fn current() -> &'static mut FakeVulkan {
        unsafe { &mut *CURRENT_FAKE_VULKAN.with(|f| f.get().unwrap()) }
    }

    fn next_result(&mut self, func_name: &str) -> vk::Result {
        match self.result_queue.get_mut(func_name) {
            Some(queue) => match queue.pop_front() {
                Some(res) => res,
                None => vk::Result::SUCCESS,
            },
            None => vk::Result::SUCCESS,
        }
    }

    /// Queue a result to return the next time the named function is
    /// called. The value will be used only once and after that the
    /// function will revert to always returning SUCCESS. This can be
    /// called multiple times to queue multiple results before
    /// reverting.
    pub fn queue_result(&mut self, func_name: &str, result: vk::Result) {
        self.result_queue
            .entry(func_name.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn add_handle(&mut self, data: HandleType) -> u64 {
        let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);

        self.handles.insert(raw, Handle { freed: false, data });

        raw
    }

    pub fn get_handle<H: vk::Handle>(&self, handle: H) -> &Handle {
        let handle = &self.handles[&handle.as_raw()];

        assert!(!handle.freed);

        handle
    }

    pub fn get_handle_mut<H: vk::Handle>(&mut self, handle: H) -> &mut Handle {
        let handle = self.handles.get_mut(&handle.as_raw()).unwrap();

        assert!(!handle.freed);

        handle
    }

    pub fn is_freed<H: vk::Handle>(&self, handle: H) -> bool {
        self.handles[&handle.as_raw()].freed
    }

    fn free_handle<H: vk::Handle + Copy>(&mut self, handle: H) {
        if !handle.is_null() {
            self.get_handle_mut(handle).freed = true;
        }
    }

    pub fn fence_signalled(&self, fence: vk::Fence) -> bool {
        match self.get_handle(fence).data {
            HandleType::Fence { signalled, .. } => signalled,
            ref other => unreachable!("{:?} is not a fence", other),
        }
    }

    fn signal_fence(&mut self, fence: vk::Fence) {
        if fence.is_null() {
            return;
        }

        let HandleType::Fence { ref mut signalled, .. } =
            self.get_handle_mut(fence).data
        else {
            unreachable!("bad handle");
        };

        *signalled = true;
    }

    fn physical_device_info(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> &PhysicalDeviceInfo {
        let HandleType::PhysicalDevice(index) =
            self.get_handle(physical_device).data
        else {
            unreachable!("bad handle");
        };

        &self.physical_devices[index]
    }

    pub fn get_function(&self, name: *const c_char) -> vk::PFN_vkVoidFunction {
        let name = unsafe { CStr::from_ptr(name).to_str().unwrap() };

        let func = match name {
            "vkGetDeviceProcAddr" => fake_fn!(
                PFN_vkGetDeviceProcAddr,
                FakeVulkan::get_device_proc_addr
            ),
            "vkCreateInstance" => fake_fn!(
                PFN_vkCreateInstance,
                FakeVulkan::create_instance
            ),
            "vkDestroyInstance" => fake_fn!(
                PFN_vkDestroyInstance,
                FakeVulkan::destroy_instance
            ),
            "vkEnumeratePhysicalDevices" => fake_fn!(
                PFN_vkEnumeratePhysicalDevices,
                FakeVulkan::enumerate_physical_devices
            ),
            "vkEnumerateDeviceExtensionProperties" => fake_fn!(
                PFN_vkEnumerateDeviceExtensionProperties,
                FakeVulkan::enumerate_device_extension_properties
            ),
            "vkGetPhysicalDeviceProperties" => fake_fn!(
                PFN_vkGetPhysicalDeviceProperties,
                FakeVulkan::get_physical_device_properties
            ),
            "vkGetPhysicalDeviceProperties2"
                | "vkGetPhysicalDeviceProperties2KHR" => fake_fn!(
                    PFN_vkGetPhysicalDeviceProperties2,
                    FakeVulkan::get_physical_device_properties2
                ),
            "vkGetPhysicalDeviceMemoryProperties" => fake_fn!(
                PFN_vkGetPhysicalDeviceMemoryProperties,
                FakeVulkan::get_physical_device_memory_properties
            ),
            "vkGetPhysicalDeviceMemoryProperties2"
                | "vkGetPhysicalDeviceMemoryProperties2KHR" => fake_fn!(
                    PFN_vkGetPhysicalDeviceMemoryProperties2,
                    FakeVulkan::get_physical_device_memory_properties2
                ),
            "vkGetPhysicalDeviceToolProperties"
                | "vkGetPhysicalDeviceToolPropertiesEXT" => fake_fn!(
                    PFN_vkGetPhysicalDeviceToolProperties,
                    FakeVulkan::get_physical_device_tool_properties
                ),
            "vkCreateDevice" => fake_fn!(
                PFN_vkCreateDevice,
                FakeVulkan::create_device
            ),
            "vkDestroyDevice" => fake_fn!(
                PFN_vkDestroyDevice,
                FakeVulkan::destroy_device
            ),
            "vkGetDeviceQueue" => fake_fn!(
                PFN_vkGetDeviceQueue,
                FakeVulkan::get_device_queue
            ),
            "vkCreateBuffer" => fake_fn!(
                PFN_vkCreateBuffer,
                FakeVulkan::create_buffer
            ),
            "vkDestroyBuffer" => fake_fn!(
                PFN_vkDestroyBuffer,
                FakeVulkan::destroy_buffer
            ),
            "vkCreateImage" => fake_fn!(
                PFN_vkCreateImage,
                FakeVulkan::create_image
            ),
            "vkDestroyImage" => fake_fn!(
                PFN_vkDestroyImage,
                FakeVulkan::destroy_image
            ),
            "vkAllocateMemory" => fake_fn!(
                PFN_vkAllocateMemory,
                FakeVulkan::allocate_memory
            ),
            "vkFreeMemory" => fake_fn!(
                PFN_vkFreeMemory,
                FakeVulkan::free_memory
            ),
            "vkBindBufferMemory" => fake_fn!(
                PFN_vkBindBufferMemory,
                FakeVulkan::bind_buffer_memory
            ),
            "vkBindImageMemory" => fake_fn!(
                PFN_vkBindImageMemory,
                FakeVulkan::bind_image_memory
            ),
            "vkBindImageMemory2" => fake_fn!(
                PFN_vkBindImageMemory2,
                FakeVulkan::bind_image_memory2
            ),
            "vkGetBufferMemoryRequirements" => fake_fn!(
                PFN_vkGetBufferMemoryRequirements,
                FakeVulkan::get_buffer_memory_requirements
            ),
            "vkGetImageMemoryRequirements" => fake_fn!(
                PFN_vkGetImageMemoryRequirements,
                FakeVulkan::get_image_memory_requirements
            ),
            "vkQueueSubmit" => fake_fn!(
                PFN_vkQueueSubmit,
                FakeVulkan::queue_submit
            ),
            "vkQueueSubmit2" | "vkQueueSubmit2KHR" => fake_fn!(
                PFN_vkQueueSubmit2,
                FakeVulkan::queue_submit2
            ),
            "vkQueueBindSparse" => fake_fn!(
                PFN_vkQueueBindSparse,
                FakeVulkan::queue_bind_sparse
            ),
            "vkCreateFence" => fake_fn!(
                PFN_vkCreateFence,
                FakeVulkan::create_fence
            ),
            "vkDestroyFence" => fake_fn!(
                PFN_vkDestroyFence,
                FakeVulkan::destroy_fence
            ),
            "vkResetFences" => fake_fn!(
                PFN_vkResetFences,
                FakeVulkan::reset_fences
            ),
            "vkGetFenceStatus" => fake_fn!(
                PFN_vkGetFenceStatus,
                FakeVulkan::get_fence_status
            ),
            "vkWaitForFences" => fake_fn!(
                PFN_vkWaitForFences,
                FakeVulkan::wait_for_fences
            ),
            "vkGetMemoryFdPropertiesKHR" => fake_fn!(
                PFN_vkGetMemoryFdPropertiesKHR,
                FakeVulkan::get_memory_fd_properties
            ),
            "vkAcquireNextImageKHR" => fake_fn!(
                PFN_vkAcquireNextImageKHR,
                FakeVulkan::acquire_next_image
            ),
            "vkQueuePresentKHR" => fake_fn!(
                PFN_vkQueuePresentKHR,
                FakeVulkan::queue_present
            ),
            "vkRegisterDeviceEventEXT" => fake_fn!(
                PFN_vkRegisterDeviceEventEXT,
                FakeVulkan::register_device_event
            ),
            _ => return None,
        };

        Some(func)
    }

    pub extern "system" fn get_instance_proc_addr(
        _instance: vk::Instance,
        name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        FakeVulkan::current().get_function(name)
    }

    extern "system" fn get_device_proc_addr(
        _device: vk::Device,
        name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        FakeVulkan::current().get_function(name)
    }

    extern "system" fn create_instance(
        _create_info: *const vk::InstanceCreateInfo,
        _allocator: *const vk::AllocationCallbacks,
        instance_out: *mut vk::Instance,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkCreateInstance");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            *instance_out = vk::Instance::from_raw(
                fake_vulkan.add_handle(HandleType::Instance)
            );
        }

        res
    }

    extern "system" fn destroy_instance(
        instance: vk::Instance,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        let fake_vulkan = FakeVulkan::current();

        assert!(matches!(
            fake_vulkan.get_handle(instance).data,
            HandleType::Instance,
        ));
        fake_vulkan.free_handle(instance);
    }

    extern "system" fn enumerate_physical_devices(
        _instance: vk::Instance,
        physical_device_count: *mut u32,
        physical_devices: *mut vk::PhysicalDevice,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        while fake_vulkan.physical_device_handles.len()
            < fake_vulkan.physical_devices.len()
        {
            let index = fake_vulkan.physical_device_handles.len();
            let raw = fake_vulkan.add_handle(HandleType::PhysicalDevice(index));

            fake_vulkan.physical_device_handles.push(
                vk::PhysicalDevice::from_raw(raw)
            );
        }

        let res = fake_vulkan.next_result("vkEnumeratePhysicalDevices");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            copy_with_count(
                &fake_vulkan.physical_device_handles,
                physical_device_count,
                physical_devices,
            )
        }
    }

    extern "system" fn enumerate_device_extension_properties(
        physical_device: vk::PhysicalDevice,
        _layer_name: *const c_char,
        property_count: *mut u32,
        properties: *mut vk::ExtensionProperties,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkEnumerateDeviceExtensionProperties");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            copy_with_count(
                &fake_vulkan.physical_device_info(physical_device).extensions,
                property_count,
                properties,
            )
        }
    }

    extern "system" fn get_physical_device_properties(
        physical_device: vk::PhysicalDevice,
        properties_out: *mut vk::PhysicalDeviceProperties,
    ) {
        let fake_vulkan = FakeVulkan::current();

        unsafe {
            *properties_out =
                fake_vulkan.physical_device_info(physical_device).properties;
        }
    }

    extern "system" fn get_physical_device_properties2(
        physical_device: vk::PhysicalDevice,
        properties_out: *mut vk::PhysicalDeviceProperties2,
    ) {
        let fake_vulkan = FakeVulkan::current();

        unsafe {
            (*properties_out).properties =
                fake_vulkan.physical_device_info(physical_device).properties;
        }
    }

    extern "system" fn get_physical_device_memory_properties(
        physical_device: vk::PhysicalDevice,
        memory_properties_out: *mut vk::PhysicalDeviceMemoryProperties,
    ) {
        let fake_vulkan = FakeVulkan::current();

        unsafe {
            *memory_properties_out = fake_vulkan
                .physical_device_info(physical_device)
                .memory_properties;
        }
    }

    extern "system" fn get_physical_device_memory_properties2(
        physical_device: vk::PhysicalDevice,
        memory_properties_out: *mut vk::PhysicalDeviceMemoryProperties2,
    ) {
        let fake_vulkan = FakeVulkan::current();
        let info = fake_vulkan.physical_device_info(physical_device).clone();
        let props = unsafe { &mut *memory_properties_out };

        props.memory_properties = info.memory_properties;

        let budget = unsafe {
            chain::find_in_chain_mut::<
                vk::PhysicalDeviceMemoryBudgetPropertiesEXT
            >(
                props.p_next,
                vk::StructureType::PHYSICAL_DEVICE_MEMORY_BUDGET_PROPERTIES_EXT,
            )
        };

        if let Some(budget) = budget {
            budget.heap_budget = info.heap_budget;
            budget.heap_usage = info.heap_usage;
            fake_vulkan.budget_queries += 1;
        }
    }

    extern "system" fn get_physical_device_tool_properties(
        _physical_device: vk::PhysicalDevice,
        tool_count: *mut u32,
        tools_out: *mut vk::PhysicalDeviceToolProperties,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let tools = fake_vulkan.tools
            .iter()
            .map(|&name| {
                let mut props = vk::PhysicalDeviceToolProperties::default();
                copy_to_c_array(&mut props.name, name);
                props
            })
            .collect::<Vec<_>>();

        unsafe { copy_with_count(&tools, tool_count, tools_out) }
    }

    extern "system" fn create_device(
        _physical_device: vk::PhysicalDevice,
        create_info: *const vk::DeviceCreateInfo,
        _allocator: *const vk::AllocationCallbacks,
        device_out: *mut vk::Device,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkCreateDevice");

        if res != vk::Result::SUCCESS {
            return res;
        }

        let create_info = unsafe { &*create_info };
        let names = unsafe {
            slice_from_raw(
                create_info.pp_enabled_extension_names,
                create_info.enabled_extension_count,
            )
        };

        fake_vulkan.enabled_device_extensions = names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect();

        let queue = vk::Queue::from_raw(
            fake_vulkan.add_handle(HandleType::Queue)
        );

        unsafe {
            *device_out = vk::Device::from_raw(
                fake_vulkan.add_handle(HandleType::Device { queue })
            );
        }

        res
    }

    extern "system" fn destroy_device(
        device: vk::Device,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        let fake_vulkan = FakeVulkan::current();

        assert!(matches!(
            fake_vulkan.get_handle(device).data,
            HandleType::Device { .. },
        ));
        fake_vulkan.free_handle(device);
    }

    extern "system" fn get_device_queue(
        device: vk::Device,
        _queue_family_index: u32,
        _queue_index: u32,
        queue_out: *mut vk::Queue,
    ) {
        let fake_vulkan = FakeVulkan::current();

        let HandleType::Device { queue } = fake_vulkan.get_handle(device).data
        else {
            unreachable!("bad handle");
        };

        unsafe {
            *queue_out = queue;
        }
    }

    extern "system" fn create_buffer(
        _device: vk::Device,
        _create_info: *const vk::BufferCreateInfo,
        _allocator: *const vk::AllocationCallbacks,
        buffer_out: *mut vk::Buffer,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkCreateBuffer");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            *buffer_out = vk::Buffer::from_raw(
                fake_vulkan.add_handle(HandleType::Buffer)
            );
        }

        res
    }

    extern "system" fn destroy_buffer(
        _device: vk::Device,
        buffer: vk::Buffer,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        FakeVulkan::current().free_handle(buffer);
    }

    extern "system" fn create_image(
        _device: vk::Device,
        _create_info: *const vk::ImageCreateInfo,
        _allocator: *const vk::AllocationCallbacks,
        image_out: *mut vk::Image,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkCreateImage");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            *image_out = vk::Image::from_raw(
                fake_vulkan.add_handle(HandleType::Image)
            );
        }

        res
    }

    extern "system" fn destroy_image(
        _device: vk::Device,
        image: vk::Image,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        FakeVulkan::current().free_handle(image);
    }

    extern "system" fn allocate_memory(
        _device: vk::Device,
        allocate_info: *const vk::MemoryAllocateInfo,
        _allocator: *const vk::AllocationCallbacks,
        memory_out: *mut vk::DeviceMemory,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        fake_vulkan.allocation_count += 1;

        let res = fake_vulkan.next_result("vkAllocateMemory");

        if res != vk::Result::SUCCESS {
            return res;
        }

        let size = unsafe { (*allocate_info).allocation_size };

        unsafe {
            *memory_out = vk::DeviceMemory::from_raw(
                fake_vulkan.add_handle(HandleType::Memory { size })
            );
        }

        res
    }

    extern "system" fn free_memory(
        _device: vk::Device,
        memory: vk::DeviceMemory,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        FakeVulkan::current().free_handle(memory);
    }

    extern "system" fn bind_buffer_memory(
        _device: vk::Device,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        fake_vulkan.get_handle(buffer);
        fake_vulkan.get_handle(memory);

        fake_vulkan.next_result("vkBindBufferMemory")
    }

    extern "system" fn bind_image_memory(
        _device: vk::Device,
        image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        fake_vulkan.get_handle(image);
        fake_vulkan.get_handle(memory);

        fake_vulkan.next_result("vkBindImageMemory")
    }

    extern "system" fn bind_image_memory2(
        _device: vk::Device,
        bind_info_count: u32,
        bind_infos: *const vk::BindImageMemoryInfo,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        for info in unsafe { slice_from_raw(bind_infos, bind_info_count) } {
            fake_vulkan.get_handle(info.image);
            fake_vulkan.get_handle(info.memory);
        }

        fake_vulkan.next_result("vkBindImageMemory2")
    }

    extern "system" fn get_buffer_memory_requirements(
        _device: vk::Device,
        buffer: vk::Buffer,
        requirements_out: *mut vk::MemoryRequirements,
    ) {
        let fake_vulkan = FakeVulkan::current();

        fake_vulkan.get_handle(buffer);

        unsafe {
            *requirements_out = fake_vulkan.memory_requirements;
        }
    }

    extern "system" fn get_image_memory_requirements(
        _device: vk::Device,
        image: vk::Image,
        requirements_out: *mut vk::MemoryRequirements,
    ) {
        let fake_vulkan = FakeVulkan::current();

        fake_vulkan.get_handle(image);

        unsafe {
            *requirements_out = fake_vulkan.memory_requirements;
        }
    }

    extern "system" fn queue_submit(
        _queue: vk::Queue,
        _submit_count: u32,
        _submits: *const vk::SubmitInfo,
        fence: vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkQueueSubmit");

        if res == vk::Result::SUCCESS {
            fake_vulkan.signal_fence(fence);
        }

        res
    }

    extern "system" fn queue_submit2(
        _queue: vk::Queue,
        _submit_count: u32,
        _submits: *const vk::SubmitInfo2,
        fence: vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkQueueSubmit2");

        if res == vk::Result::SUCCESS {
            fake_vulkan.signal_fence(fence);
        }

        res
    }

    extern "system" fn queue_bind_sparse(
        _queue: vk::Queue,
        _bind_info_count: u32,
        _bind_infos: *const vk::BindSparseInfo,
        fence: vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkQueueBindSparse");

        if res == vk::Result::SUCCESS {
            fake_vulkan.signal_fence(fence);
        }

        res
    }

    extern "system" fn create_fence(
        _device: vk::Device,
        create_info: *const vk::FenceCreateInfo,
        _allocator: *const vk::AllocationCallbacks,
        fence_out: *mut vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkCreateFence");

        if res != vk::Result::SUCCESS {
            return res;
        }

        let signalled = unsafe { (*create_info).flags }
            .contains(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            *fence_out = vk::Fence::from_raw(
                fake_vulkan.add_handle(HandleType::Fence {
                    signalled,
                    reset_count: 0,
                    status_count: 0,
                })
            );
        }

        res
    }

    extern "system" fn destroy_fence(
        _device: vk::Device,
        fence: vk::Fence,
        _allocator: *const vk::AllocationCallbacks,
    ) {
        FakeVulkan::current().free_handle(fence);
    }

    extern "system" fn reset_fences(
        _device: vk::Device,
        fence_count: u32,
        fences: *const vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkResetFences");

        if res != vk::Result::SUCCESS {
            return res;
        }

        for &fence in unsafe { slice_from_raw(fences, fence_count) } {
            let HandleType::Fence {
                ref mut signalled,
                ref mut reset_count,
                ..
            } = fake_vulkan.get_handle_mut(fence).data
            else {
                unreachable!("bad handle");
            };

            *signalled = false;
            *reset_count += 1;
        }

        res
    }

    extern "system" fn get_fence_status(
        _device: vk::Device,
        fence: vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let HandleType::Fence { signalled, ref mut status_count, .. } =
            fake_vulkan.get_handle_mut(fence).data
        else {
            unreachable!("bad handle");
        };

        *status_count += 1;

        if signalled {
            vk::Result::SUCCESS
        } else {
            vk::Result::NOT_READY
        }
    }

    extern "system" fn wait_for_fences(
        _device: vk::Device,
        fence_count: u32,
        fences: *const vk::Fence,
        _wait_all: vk::Bool32,
        timeout: u64,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let fences = unsafe { slice_from_raw(fences, fence_count) }.to_vec();

        for &fence in fences.iter() {
            fake_vulkan.get_handle(fence);
        }

        fake_vulkan.fence_waits.push((fences, timeout));

        fake_vulkan.next_result("vkWaitForFences")
    }

    extern "system" fn get_memory_fd_properties(
        _device: vk::Device,
        _handle_type: vk::ExternalMemoryHandleTypeFlags,
        _fd: c_int,
        properties_out: *mut vk::MemoryFdPropertiesKHR,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkGetMemoryFdPropertiesKHR");

        if res == vk::Result::SUCCESS {
            unsafe {
                (*properties_out).memory_type_bits = 0b10;
            }
        }

        res
    }

    extern "system" fn acquire_next_image(
        _device: vk::Device,
        _swapchain: vk::SwapchainKHR,
        _timeout: u64,
        _semaphore: vk::Semaphore,
        fence: vk::Fence,
        image_index_out: *mut u32,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkAcquireNextImageKHR");

        if res == vk::Result::SUCCESS {
            fake_vulkan.signal_fence(fence);

            unsafe {
                *image_index_out = 0;
            }
        }

        res
    }

    extern "system" fn queue_present(
        _queue: vk::Queue,
        _present_info: *const vk::PresentInfoKHR,
    ) -> vk::Result {
        FakeVulkan::current().next_result("vkQueuePresentKHR")
    }

    extern "system" fn register_device_event(
        _device: vk::Device,
        _event_info: *const vk::DeviceEventInfoEXT,
        _allocator: *const vk::AllocationCallbacks,
        fence_out: *mut vk::Fence,
    ) -> vk::Result {
        let fake_vulkan = FakeVulkan::current();

        let res = fake_vulkan.next_result("vkRegisterDeviceEventEXT");

        if res != vk::Result::SUCCESS {
            return res;
        }

        unsafe {
            *fence_out = vk::Fence::from_raw(
                fake_vulkan.add_handle(HandleType::Fence {
                    signalled: false,
                    reset_count: 0,
                    status_count: 0,
                })
            );
        }

        res
    }
}

impl Drop for FakeVulkan {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let old_value = CURRENT_FAKE_VULKAN.with(|f| f.replace(None));
            // There should only be one FakeVulkan at a time so the
            // one we just dropped should be the one that was set for
            // the current thread.
            assert_eq!(old_value.unwrap(), self as *mut FakeVulkan);
        }
    }
}

/// Calls a layer’s vkCreateInstance the way the loader would, with a
/// link to the fake driver in the chain.
pub unsafe fn create_instance_with_link(
    create: vk::PFN_vkCreateInstance,
    api_version: u32,
    extensions: &[&CStr],
    instance_out: &mut vk::Instance,
) -> vk::Result {
    let mut link = vk::LayerInstanceLink {
        p_next: ptr::null_mut(),
        pfn_next_get_instance_proc_addr: Some(
            FakeVulkan::get_instance_proc_addr
        ),
        pfn_next_get_physical_device_proc_addr: None,
    };
    let mut link_info = vk::LayerInstanceCreateInfo {
        s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
        p_next: ptr::null(),
        function: vk::LayerFunction::LAYER_LINK_INFO,
        u: vk::LayerInstanceCreateInfoPayload {
            p_layer_info: ptr::addr_of_mut!(link),
        },
    };
    let app_info = vk::ApplicationInfo {
        api_version,
        ..Default::default()
    };
    let names = extensions.iter().map(|ext| ext.as_ptr()).collect::<Vec<_>>();
    let create_info = vk::InstanceCreateInfo {
        p_next: ptr::addr_of_mut!(link_info).cast(),
        p_application_info: &app_info,
        enabled_extension_count: names.len() as u32,
        pp_enabled_extension_names: names.as_ptr(),
        ..Default::default()
    };

    create(&create_info, ptr::null(), instance_out)
}

/// Calls a layer’s vkCreateDevice with a link to the fake driver.
pub unsafe fn create_device_with_link(
    create: vk::PFN_vkCreateDevice,
    physical_device: vk::PhysicalDevice,
    extensions: &[&CStr],
    device_out: &mut vk::Device,
) -> vk::Result {
    let mut link = vk::LayerDeviceLink {
        p_next: ptr::null_mut(),
        pfn_next_get_instance_proc_addr: Some(
            FakeVulkan::get_instance_proc_addr
        ),
        pfn_next_get_device_proc_addr: Some(
            FakeVulkan::get_device_proc_addr
        ),
    };
    let mut link_info = vk::LayerDeviceCreateInfo {
        s_type: vk::StructureType::LOADER_DEVICE_CREATE_INFO,
        p_next: ptr::null(),
        function: vk::LayerFunction::LAYER_LINK_INFO,
        u: vk::LayerDeviceCreateInfoPayload {
            p_layer_info: ptr::addr_of_mut!(link),
        },
    };
    let names = extensions.iter().map(|ext| ext.as_ptr()).collect::<Vec<_>>();
    let create_info = vk::DeviceCreateInfo {
        p_next: ptr::addr_of_mut!(link_info).cast(),
        enabled_extension_count: names.len() as u32,
        pp_enabled_extension_names: names.as_ptr(),
        ..Default::default()
    };

    create(physical_device, &create_info, ptr::null(), device_out)
}

/// An instance and a device created through a layer on top of the
/// fake driver. Both are destroyed through the layer again when the
/// harness is dropped.
pub struct LayerHarness<L: Layer> {
    pub fake_vulkan: Box<FakeVulkan>,
    pub instance: vk::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: vk::Device,
    pub queue: vk::Queue,
    _layer: PhantomData<L>,
}

impl<L: Layer> LayerHarness<L> {
    pub fn new(
        fake_vulkan: Box<FakeVulkan>,
        api_version: u32,
        instance_extensions: &[&CStr],
        device_extensions: &[&CStr],
    ) -> LayerHarness<L> {
        let mut instance = vk::Instance::null();
        let res = unsafe {
            create_instance_with_link(
                layer::create_instance::<L>,
                api_version,
                instance_extensions,
                &mut instance,
            )
        };
        assert_eq!(res, vk::Result::SUCCESS);

        let mut count = 1;
        let mut physical_device = vk::PhysicalDevice::null();
        let res = unsafe {
            layer::enumerate_physical_devices::<L>(
                instance,
                &mut count,
                &mut physical_device,
            )
        };
        assert!(matches!(res, vk::Result::SUCCESS | vk::Result::INCOMPLETE));

        let mut device = vk::Device::null();
        let res = unsafe {
            create_device_with_link(
                layer::create_device::<L>,
                physical_device,
                device_extensions,
                &mut device,
            )
        };
        assert_eq!(res, vk::Result::SUCCESS);

        let mut queue = vk::Queue::null();
        unsafe {
            layer::get_device_queue::<L>(device, 0, 0, &mut queue);
        }

        LayerHarness {
            fake_vulkan,
            instance,
            physical_device,
            device,
            queue,
            _layer: PhantomData,
        }
    }

    /// A device with the default fake physical device, the latest
    /// API version and no extensions.
    pub fn simple() -> LayerHarness<L> {
        LayerHarness::new(
            FakeVulkan::new(),
            vk::make_api_version(0, 1, 3, 0),
            &[],
            &[],
        )
    }

    pub fn create_buffer(&self, size: vk::DeviceSize) -> vk::Buffer {
        let create_info = vk::BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            ..Default::default()
        };
        let mut buffer = vk::Buffer::null();

        let res = unsafe {
            layer::create_buffer::<L>(
                self.device,
                &create_info,
                ptr::null(),
                &mut buffer,
            )
        };
        assert_eq!(res, vk::Result::SUCCESS);

        buffer
    }

    pub fn allocate(
        &self,
        memory_type_index: u32,
        size: vk::DeviceSize,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: size,
            memory_type_index,
            ..Default::default()
        };
        let mut memory = vk::DeviceMemory::null();

        let res = unsafe {
            layer::allocate_memory::<L>(
                self.device,
                &allocate_info,
                ptr::null(),
                &mut memory,
            )
        };

        match res {
            vk::Result::SUCCESS => Ok(memory),
            other => Err(other),
        }
    }

    pub fn submit(&self, fence: vk::Fence) -> vk::Result {
        unsafe {
            layer::queue_submit::<L>(self.queue, 0, ptr::null(), fence)
        }
    }
}

impl<L: Layer> Drop for LayerHarness<L> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        unsafe {
            layer::destroy_device::<L>(self.device, ptr::null());
            layer::destroy_instance::<L>(self.instance, ptr::null());
        }
    }
}
