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

//! The parts shared by both layers. Each layer implements [Layer] to
//! describe itself and to add the entry points that only it needs.
//! The entry points here are generic over the layer so that each one
//! gets its own copy with its own process-wide [LayerState].
//!
//! Locks are always taken in this order: the global maps (and only one
//! of them at a time), a physical device’s state, a device’s resource
//! or fence tables and then the external memory maps. None of them are
//! held while calling down the chain except the physical device state
//! during an admitted allocation. The memory report holds the instance
//! map for its whole duration.

use crate::budget::MemoryTable;
use crate::chain::{self, DeviceLink};
use crate::config::SimulatorConfig;
use crate::error::{check, to_vk_result, LayerError};
use crate::extension_info::{BufferInfo, ImageBindInfo, ImageInfo, MemoryInfo};
use crate::extensions::{DeviceExtensions, InstanceExtensions, MEMORY_BUDGET_EXTENSION};
use crate::fence_delay::FenceState;
use crate::registry::HandleMap;
use crate::report::ExternalMemoryRecord;
use crate::tracker::{BufferRecord, ImageRecord, MemoryRecord, ResourceTables};
use crate::util::{c_array_to_str, c_str_array, copy_to_c_array, copy_with_count, slice_from_raw};
use crate::vk::{self, Handle};
use crate::vulkan_funcs::{DeviceFuncs, InstanceFuncs};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr};
use std::mem::transmute;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Builds a lookup from a command name to one of the layer’s entry
/// points. Each entry names the Vulkan function pointer type so that
/// a signature mismatch is a compile error.
macro_rules! proc_table {
    ($name:expr => { $($proc:literal => $func:path : $ty:ident,)* }) => {
        match $name {
            $(
                $proc => Some(unsafe {
                    transmute::<vk::$ty, unsafe extern "system" fn()>($func)
                }),
            )*
            _ => None,
        }
    };
}

pub(crate) use proc_table;

/// The identity and the layer-specific behaviour of one of the layers
/// in this library.
pub trait Layer: Sized + 'static {
    const LAYER_NAME: &'static str;
    const SPEC_VERSION: u32;
    const IMPLEMENTATION_VERSION: u32;
    const DESCRIPTION: &'static str;

    const TOOL_NAME: &'static str;
    const TOOL_VERSION: &'static str;
    const TOOL_PURPOSES: vk::ToolPurposeFlags;
    const TOOL_DESCRIPTION: &'static str;

    /// Device extensions whose support is noted when the application
    /// enumerates them.
    const TRACKED_EXTENSIONS: DeviceExtensions;

    /// Whether `VK_EXT_memory_budget` is enabled behind the
    /// application’s back when the device supports it.
    const FORCE_MEMORY_BUDGET: bool;

    fn state() -> &'static LayerState;

    /// Read once for every instance that is created.
    fn settings() -> SimulatorConfig {
        SimulatorConfig::default()
    }

    /// The device-level entry points that are always intercepted.
    fn device_commands(name: &[u8]) -> vk::PFN_vkVoidFunction;

    /// The device-level entry points that depend on a core version or
    /// an extension being enabled.
    fn device_extension_commands(
        enabled: DeviceExtensions,
        name: &[u8],
    ) -> vk::PFN_vkVoidFunction;

    /// Lets the layer change the memory properties that the
    /// application sees. The cached copy is taken before this.
    fn adjust_memory_properties(
        _config: &SimulatorConfig,
        _props: &mut vk::PhysicalDeviceMemoryProperties,
        _budget: Option<&mut vk::PhysicalDeviceMemoryBudgetPropertiesEXT>,
    ) {
    }

    fn device_created(_device: &DeviceRecord) {
    }

    /// Called after a queue submission succeeded.
    fn submitted(_device: &DeviceRecord, _fence: vk::Fence) {
    }
}

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reports that the next layer doesn’t provide a function that is
/// needed.
pub(crate) fn missing(name: &'static str) -> vk::Result {
    let error = LayerError::MissingFunction(name);
    log::error!("{}", error);
    error.result()
}

pub struct InstanceRecord {
    pub handle: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub funcs: InstanceFuncs,
    pub extensions: InstanceExtensions,
    pub config: SimulatorConfig,
}

#[derive(Debug, Default)]
pub struct PhysicalDeviceState {
    pub properties: Option<vk::PhysicalDeviceProperties>,
    pub memory: MemoryTable,
    /// `None` until the device’s extensions have been enumerated.
    pub supported: Option<DeviceExtensions>,
}

pub struct PhysicalDeviceRecord {
    pub handle: vk::PhysicalDevice,
    pub instance: vk::Instance,
    pub funcs: InstanceFuncs,
    pub instance_extensions: InstanceExtensions,
    pub config: SimulatorConfig,
    pub state: Mutex<PhysicalDeviceState>,
}

pub struct DeviceRecord {
    pub handle: vk::Device,
    pub physical_device: Arc<PhysicalDeviceRecord>,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub funcs: DeviceFuncs,
    pub enabled: DeviceExtensions,
    pub config: SimulatorConfig,
    pub resources: Mutex<ResourceTables>,
    pub fences: Mutex<HandleMap<vk::Fence, FenceState>>,
}

/// Shadow state for every object the layer has seen in this process.
#[derive(Default)]
pub struct LayerState {
    pub instances: Mutex<HandleMap<vk::Instance, Arc<InstanceRecord>>>,
    pub physical_devices:
        Mutex<HandleMap<vk::PhysicalDevice, Arc<PhysicalDeviceRecord>>>,
    pub devices: Mutex<HandleMap<vk::Device, Arc<DeviceRecord>>>,
    pub queues: Mutex<HashMap<vk::Queue, vk::Device>>,
    pub external_fds: Mutex<HandleMap<i32, ExternalMemoryRecord>>,
    pub android_buffers: Mutex<HandleMap<usize, ExternalMemoryRecord>>,
}

impl LayerState {
    pub fn instance(&self, handle: vk::Instance) -> Option<Arc<InstanceRecord>> {
        let record = lock(&self.instances).get(handle).cloned();

        if record.is_none() {
            log::warn!("unknown {:?}", handle);
        }

        record
    }

    pub fn physical_device(
        &self,
        handle: vk::PhysicalDevice,
    ) -> Option<Arc<PhysicalDeviceRecord>> {
        let record = lock(&self.physical_devices).get(handle).cloned();

        if record.is_none() {
            log::warn!("unknown {:?}", handle);
        }

        record
    }

    pub fn device(&self, handle: vk::Device) -> Option<Arc<DeviceRecord>> {
        let record = lock(&self.devices).get(handle).cloned();

        if record.is_none() {
            log::warn!("unknown {:?}", handle);
        }

        record
    }

    pub fn queue_device(&self, queue: vk::Queue) -> Option<Arc<DeviceRecord>> {
        let device = lock(&self.queues).get(&queue).copied();

        match device {
            Some(device) => self.device(device),
            None => {
                log::warn!("unknown {:?}", queue);
                None
            },
        }
    }

    fn add_physical_devices(
        &self,
        instance: &InstanceRecord,
        handles: &[vk::PhysicalDevice],
    ) {
        let mut physical_devices = lock(&self.physical_devices);

        for &handle in handles {
            if handle.is_null() || physical_devices.contains(handle) {
                continue;
            }

            physical_devices.insert(
                handle,
                Arc::new(PhysicalDeviceRecord {
                    handle,
                    instance: instance.handle,
                    funcs: instance.funcs,
                    instance_extensions: instance.extensions,
                    config: instance.config,
                    state: Mutex::new(PhysicalDeviceState::default()),
                }),
            );
        }
    }

    /// Removes everything that refers to the device apart from its
    /// record in the device map.
    fn forget_device_children(&self, device: vk::Device) {
        lock(&self.queues).retain(|_, d| *d != device);
        lock(&self.external_fds).erase_where(|_, r| r.device == device);
        lock(&self.android_buffers).erase_where(|_, r| r.device == device);
    }

    fn forget_device(&self, device: vk::Device) {
        lock(&self.devices).erase(device);
        self.forget_device_children(device);
    }

    fn forget_instance(&self, instance: vk::Instance) {
        lock(&self.instances).erase(instance);
        lock(&self.physical_devices).erase_where(|_, p| p.instance == instance);

        let devices = lock(&self.devices).erase_where(|_, d| {
            d.physical_device.instance == instance
        });

        for (device, _) in devices {
            self.forget_device_children(device);
        }
    }
}

impl PhysicalDeviceRecord {
    /// The cached properties, queried from the next layer the first
    /// time.
    pub unsafe fn properties(&self) -> Option<vk::PhysicalDeviceProperties> {
        if let Some(props) = lock(&self.state).properties {
            return Some(props);
        }

        let get = self.funcs.vkGetPhysicalDeviceProperties?;
        let mut props = vk::PhysicalDeviceProperties::default();
        get(self.handle, &mut props);

        lock(&self.state).properties = Some(props);

        Some(props)
    }

    pub fn device_name(&self) -> String {
        match lock(&self.state).properties {
            Some(props) => c_array_to_str(&props.device_name).into_owned(),
            None => String::new(),
        }
    }

    fn memory_properties2_fn(
        &self,
    ) -> Option<vk::PFN_vkGetPhysicalDeviceMemoryProperties2> {
        let core = self.instance_extensions
            .contains(InstanceExtensions::CORE_1_1)
            .then_some(self.funcs.vkGetPhysicalDeviceMemoryProperties2)
            .flatten();
        let khr = self.instance_extensions
            .contains(InstanceExtensions::KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2)
            .then_some(self.funcs.vkGetPhysicalDeviceMemoryProperties2KHR)
            .flatten();

        core.or(khr)
    }

    /// Queries the memory properties from the next layer and updates
    /// the cached table. The budget is included if asked for and if
    /// the instance can chain it.
    pub unsafe fn refresh_memory(&self, with_budget: bool) {
        match self.memory_properties2_fn() {
            Some(get) if with_budget => {
                let mut budget =
                    vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
                let mut props = vk::PhysicalDeviceMemoryProperties2 {
                    p_next: ptr::addr_of_mut!(budget).cast(),
                    ..Default::default()
                };

                get(self.handle, &mut props);

                lock(&self.state).memory.update(
                    &props.memory_properties,
                    Some(&budget),
                );
            },
            _ => {
                let Some(get) = self.funcs.vkGetPhysicalDeviceMemoryProperties
                else {
                    missing("vkGetPhysicalDeviceMemoryProperties");
                    return;
                };
                let mut props = vk::PhysicalDeviceMemoryProperties::default();

                get(self.handle, &mut props);

                lock(&self.state).memory.update(&props, None);
            },
        }
    }

    /// Notes that a binding changed so the budget needs refreshing.
    pub fn mark_budget_stale(&self) {
        lock(&self.state).memory.budget_updated = false;
    }
}

impl DeviceRecord {
    /// Picks up a change of bindings after a successful submission.
    /// The physical device’s budget is refreshed if nothing has done
    /// it since the change. Returns whether there was a change.
    pub fn refresh_after_submit(&self) -> bool {
        if !lock(&self.resources).take_bindings_updated() {
            return false;
        }

        let physical_device = &self.physical_device;

        if !lock(&physical_device.state).memory.budget_updated {
            unsafe {
                physical_device.refresh_memory(
                    self.enabled.contains(DeviceExtensions::EXT_MEMORY_BUDGET)
                );
            }
        }

        true
    }
}

fn layer_properties<L: Layer>() -> vk::LayerProperties {
    let mut props = vk::LayerProperties {
        spec_version: L::SPEC_VERSION,
        implementation_version: L::IMPLEMENTATION_VERSION,
        ..Default::default()
    };

    copy_to_c_array(&mut props.layer_name, L::LAYER_NAME);
    copy_to_c_array(&mut props.description, L::DESCRIPTION);

    props
}

unsafe fn is_this_layer<L: Layer>(layer_name: *const c_char) -> bool {
    !layer_name.is_null()
        && CStr::from_ptr(layer_name).to_bytes() == L::LAYER_NAME.as_bytes()
}

fn write_tool_properties<L: Layer>(props: &mut vk::PhysicalDeviceToolProperties) {
    copy_to_c_array(&mut props.name, L::TOOL_NAME);
    copy_to_c_array(&mut props.version, L::TOOL_VERSION);
    props.purposes = L::TOOL_PURPOSES;
    copy_to_c_array(&mut props.description, L::TOOL_DESCRIPTION);
    copy_to_c_array(&mut props.layer, L::LAYER_NAME);
}

fn record_supported_extensions<L: Layer>(
    physical_device: &PhysicalDeviceRecord,
    extensions: &[vk::ExtensionProperties],
) -> DeviceExtensions {
    let api_version = unsafe { physical_device.properties() }
        .map_or(0, |props| props.api_version);
    let names = extensions
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok());
    let supported = DeviceExtensions::core_versions(
        physical_device.instance_extensions,
        api_version,
    ) | (DeviceExtensions::from_names(names) & L::TRACKED_EXTENSIONS);

    lock(&physical_device.state).supported = Some(supported);

    supported
}

unsafe fn query_device_extensions(
    physical_device: &PhysicalDeviceRecord,
) -> Result<Vec<vk::ExtensionProperties>, LayerError> {
    let enumerate = physical_device.funcs.vkEnumerateDeviceExtensionProperties
        .ok_or(LayerError::MissingFunction(
            "vkEnumerateDeviceExtensionProperties"
        ))?;

    loop {
        let mut count = 0;

        check(enumerate(
            physical_device.handle,
            ptr::null(),
            &mut count,
            ptr::null_mut(),
        ))?;

        let mut props = vec![vk::ExtensionProperties::default(); count as usize];

        match enumerate(
            physical_device.handle,
            ptr::null(),
            &mut count,
            props.as_mut_ptr(),
        ) {
            vk::Result::SUCCESS => {
                props.truncate(count as usize);
                return Ok(props);
            },
            // The list grew in between the two calls
            vk::Result::INCOMPLETE => continue,
            res => return Err(LayerError::Vulkan(res)),
        }
    }
}

/// The supported extensions of the physical device. They are queried
/// from the next layer if the application hasn’t enumerated them yet.
unsafe fn supported_extensions<L: Layer>(
    physical_device: &PhysicalDeviceRecord,
) -> DeviceExtensions {
    if let Some(supported) = lock(&physical_device.state).supported {
        return supported;
    }

    match query_device_extensions(physical_device) {
        Ok(props) => record_supported_extensions::<L>(physical_device, &props),
        Err(e) => {
            log::warn!("{}", e);
            DeviceExtensions::empty()
        },
    }
}

// Instance level

pub unsafe extern "system" fn create_instance<L: Layer>(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    // Fails if the application already installed a logger
    let _ = env_logger::try_init();

    log::trace!("{}: vkCreateInstance", L::LAYER_NAME);

    to_vk_result(|| {
        let next_gipa = chain::take_instance_link(p_create_info)?;
        let create = transmute::<_, Option<vk::PFN_vkCreateInstance>>(
            next_gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr())
        ).ok_or(LayerError::MissingFunction("vkCreateInstance"))?;

        check(create(p_create_info, p_allocator, p_instance))?;

        let instance = *p_instance;
        let create_info = &*p_create_info;
        let api_version = create_info.p_application_info
            .as_ref()
            .map_or(0, |app| app.api_version);
        let extensions = InstanceExtensions::from_create_info(
            api_version,
            c_str_array(
                create_info.pp_enabled_extension_names,
                create_info.enabled_extension_count,
            ),
        );
        let funcs = InstanceFuncs::load(|name| {
            next_gipa(instance, name.as_ptr())
        });
        let config = L::settings();

        log::debug!(
            "{}: {:?} with {:?} and {:?}",
            L::LAYER_NAME,
            instance,
            extensions,
            config,
        );

        lock(&L::state().instances).insert(
            instance,
            Arc::new(InstanceRecord {
                handle: instance,
                get_instance_proc_addr: next_gipa,
                funcs,
                extensions,
                config,
            }),
        );

        Ok(())
    })
}

pub unsafe extern "system" fn destroy_instance<L: Layer>(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    log::trace!("{}: vkDestroyInstance", L::LAYER_NAME);

    let state = L::state();
    let Some(record) = state.instance(instance) else {
        return;
    };

    match record.funcs.vkDestroyInstance {
        Some(destroy) => destroy(instance, p_allocator),
        None => {
            missing("vkDestroyInstance");
        },
    }

    state.forget_instance(instance);
}

pub unsafe extern "system" fn enumerate_physical_devices<L: Layer>(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let state = L::state();
    let Some(record) = state.instance(instance) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(enumerate) = record.funcs.vkEnumeratePhysicalDevices else {
        return missing("vkEnumeratePhysicalDevices");
    };

    let res = enumerate(instance, p_physical_device_count, p_physical_devices);

    if matches!(res, vk::Result::SUCCESS | vk::Result::INCOMPLETE)
        && !p_physical_device_count.is_null()
    {
        state.add_physical_devices(
            &record,
            slice_from_raw(p_physical_devices, *p_physical_device_count),
        );
    }

    res
}

unsafe fn enumerate_groups<L: Layer>(
    instance: vk::Instance,
    p_group_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
    khr: bool,
) -> vk::Result {
    let state = L::state();
    let Some(record) = state.instance(instance) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let (first, second) = (
        record.funcs.vkEnumeratePhysicalDeviceGroups,
        record.funcs.vkEnumeratePhysicalDeviceGroupsKHR,
    );
    let enumerate = if khr { second.or(first) } else { first.or(second) };
    let Some(enumerate) = enumerate else {
        return missing("vkEnumeratePhysicalDeviceGroups");
    };

    let res = enumerate(instance, p_group_count, p_groups);

    if matches!(res, vk::Result::SUCCESS | vk::Result::INCOMPLETE)
        && !p_group_count.is_null()
    {
        for group in slice_from_raw(p_groups.cast_const(), *p_group_count) {
            let count = (group.physical_device_count as usize)
                .min(group.physical_devices.len());

            state.add_physical_devices(
                &record,
                &group.physical_devices[0..count],
            );
        }
    }

    res
}

pub unsafe extern "system" fn enumerate_physical_device_groups<L: Layer>(
    instance: vk::Instance,
    p_group_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
) -> vk::Result {
    enumerate_groups::<L>(instance, p_group_count, p_groups, false)
}

pub unsafe extern "system" fn enumerate_physical_device_groups_khr<L: Layer>(
    instance: vk::Instance,
    p_group_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
) -> vk::Result {
    enumerate_groups::<L>(instance, p_group_count, p_groups, true)
}

pub unsafe extern "system" fn enumerate_instance_layer_properties<L: Layer>(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    copy_with_count(&[layer_properties::<L>()], p_property_count, p_properties)
}

pub unsafe extern "system" fn enumerate_instance_extension_properties<L: Layer>(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if is_this_layer::<L>(p_layer_name) {
        copy_with_count(&[], p_property_count, p_properties)
    } else {
        vk::Result::ERROR_LAYER_NOT_PRESENT
    }
}

pub unsafe extern "system" fn enumerate_device_layer_properties<L: Layer>(
    _physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    copy_with_count(&[layer_properties::<L>()], p_property_count, p_properties)
}

pub unsafe extern "system" fn enumerate_device_extension_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if is_this_layer::<L>(p_layer_name) {
        return copy_with_count(&[], p_property_count, p_properties);
    }

    let Some(record) = L::state().physical_device(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(enumerate) = record.funcs.vkEnumerateDeviceExtensionProperties
    else {
        return missing("vkEnumerateDeviceExtensionProperties");
    };

    let res = enumerate(
        physical_device,
        p_layer_name,
        p_property_count,
        p_properties,
    );

    // Only the full list of the driver and implicit layers says what
    // the device supports
    if res == vk::Result::SUCCESS
        && p_layer_name.is_null()
        && !p_properties.is_null()
    {
        record_supported_extensions::<L>(
            &record,
            slice_from_raw(p_properties.cast_const(), *p_property_count),
        );
    }

    res
}

pub unsafe extern "system" fn get_physical_device_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    let Some(record) = L::state().physical_device(physical_device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetPhysicalDeviceProperties else {
        missing("vkGetPhysicalDeviceProperties");
        return;
    };

    get(physical_device, p_properties);

    if let Some(props) = p_properties.as_ref() {
        lock(&record.state).properties = Some(*props);
    }
}

unsafe fn properties2<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties2,
    khr: bool,
) {
    let Some(record) = L::state().physical_device(physical_device) else {
        return;
    };
    let (first, second) = (
        record.funcs.vkGetPhysicalDeviceProperties2,
        record.funcs.vkGetPhysicalDeviceProperties2KHR,
    );
    let get = if khr { second.or(first) } else { first.or(second) };
    let Some(get) = get else {
        missing("vkGetPhysicalDeviceProperties2");
        return;
    };

    get(physical_device, p_properties);

    if let Some(props) = p_properties.as_ref() {
        lock(&record.state).properties = Some(props.properties);
    }
}

pub unsafe extern "system" fn get_physical_device_properties2<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties2,
) {
    properties2::<L>(physical_device, p_properties, false);
}

pub unsafe extern "system" fn get_physical_device_properties2_khr<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties2,
) {
    properties2::<L>(physical_device, p_properties, true);
}

pub unsafe extern "system" fn get_physical_device_memory_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    let Some(record) = L::state().physical_device(physical_device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetPhysicalDeviceMemoryProperties else {
        missing("vkGetPhysicalDeviceMemoryProperties");
        return;
    };

    get(physical_device, p_memory_properties);

    if let Some(props) = p_memory_properties.as_mut() {
        lock(&record.state).memory.update(props, None);
        L::adjust_memory_properties(&record.config, props, None);
    }
}

unsafe fn memory_properties2<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties2,
    khr: bool,
) {
    let Some(record) = L::state().physical_device(physical_device) else {
        return;
    };
    let (first, second) = (
        record.funcs.vkGetPhysicalDeviceMemoryProperties2,
        record.funcs.vkGetPhysicalDeviceMemoryProperties2KHR,
    );
    let get = if khr { second.or(first) } else { first.or(second) };
    let Some(get) = get else {
        missing("vkGetPhysicalDeviceMemoryProperties2");
        return;
    };

    get(physical_device, p_memory_properties);

    let Some(props) = p_memory_properties.as_mut() else {
        return;
    };

    let mut budget = chain::find_in_chain_mut::<
        vk::PhysicalDeviceMemoryBudgetPropertiesEXT
    >(
        props.p_next,
        vk::StructureType::PHYSICAL_DEVICE_MEMORY_BUDGET_PROPERTIES_EXT,
    );

    lock(&record.state).memory.update(
        &props.memory_properties,
        budget.as_deref(),
    );

    L::adjust_memory_properties(
        &record.config,
        &mut props.memory_properties,
        budget.as_deref_mut(),
    );
}

pub unsafe extern "system" fn get_physical_device_memory_properties2<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties2,
) {
    memory_properties2::<L>(physical_device, p_memory_properties, false);
}

pub unsafe extern "system" fn get_physical_device_memory_properties2_khr<
    L: Layer
>(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties2,
) {
    memory_properties2::<L>(physical_device, p_memory_properties, true);
}

unsafe fn tool_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_tool_count: *mut u32,
    p_tool_properties: *mut vk::PhysicalDeviceToolProperties,
    ext: bool,
) -> vk::Result {
    let Some(record) = L::state().physical_device(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(count) = p_tool_count.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let (first, second) = (
        record.funcs.vkGetPhysicalDeviceToolProperties,
        record.funcs.vkGetPhysicalDeviceToolPropertiesEXT,
    );
    let next = if ext { second.or(first) } else { first.or(second) };

    if p_tool_properties.is_null() {
        let res = match next {
            Some(next) => next(physical_device, count, ptr::null_mut()),
            None => {
                *count = 0;
                vk::Result::SUCCESS
            },
        };

        *count += 1;

        return res;
    }

    if *count == 0 {
        return vk::Result::INCOMPLETE;
    }

    write_tool_properties::<L>(&mut *p_tool_properties);

    *count -= 1;

    let res = match next {
        Some(next) => next(physical_device, count, p_tool_properties.add(1)),
        None => {
            *count = 0;
            vk::Result::SUCCESS
        },
    };

    *count += 1;

    res
}

pub unsafe extern "system" fn get_physical_device_tool_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_tool_count: *mut u32,
    p_tool_properties: *mut vk::PhysicalDeviceToolProperties,
) -> vk::Result {
    tool_properties::<L>(physical_device, p_tool_count, p_tool_properties, false)
}

pub unsafe extern "system" fn get_physical_device_tool_properties_ext<
    L: Layer
>(
    physical_device: vk::PhysicalDevice,
    p_tool_count: *mut u32,
    p_tool_properties: *mut vk::PhysicalDeviceToolProperties,
) -> vk::Result {
    tool_properties::<L>(physical_device, p_tool_count, p_tool_properties, true)
}

unsafe fn external_buffer_properties<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_external_buffer_info: *const vk::PhysicalDeviceExternalBufferInfo,
    p_external_buffer_properties: *mut vk::ExternalBufferProperties,
    khr: bool,
) {
    let Some(record) = L::state().physical_device(physical_device) else {
        return;
    };
    let (first, second) = (
        record.funcs.vkGetPhysicalDeviceExternalBufferProperties,
        record.funcs.vkGetPhysicalDeviceExternalBufferPropertiesKHR,
    );

    match if khr { second.or(first) } else { first.or(second) } {
        Some(get) => get(
            physical_device,
            p_external_buffer_info,
            p_external_buffer_properties,
        ),
        None => {
            missing("vkGetPhysicalDeviceExternalBufferProperties");
        },
    }
}

pub unsafe extern "system" fn get_physical_device_external_buffer_properties<
    L: Layer
>(
    physical_device: vk::PhysicalDevice,
    p_external_buffer_info: *const vk::PhysicalDeviceExternalBufferInfo,
    p_external_buffer_properties: *mut vk::ExternalBufferProperties,
) {
    external_buffer_properties::<L>(
        physical_device,
        p_external_buffer_info,
        p_external_buffer_properties,
        false,
    );
}

pub unsafe extern "system" fn get_physical_device_external_buffer_properties_khr<
    L: Layer
>(
    physical_device: vk::PhysicalDevice,
    p_external_buffer_info: *const vk::PhysicalDeviceExternalBufferInfo,
    p_external_buffer_properties: *mut vk::ExternalBufferProperties,
) {
    external_buffer_properties::<L>(
        physical_device,
        p_external_buffer_info,
        p_external_buffer_properties,
        true,
    );
}

// Device creation

pub unsafe extern "system" fn create_device<L: Layer>(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    log::trace!("{}: vkCreateDevice", L::LAYER_NAME);

    let Some(record) = L::state().physical_device(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    to_vk_result(|| {
        let link = chain::take_device_link(p_create_info)?;

        create_device_with_link::<L>(
            &record,
            link,
            &*p_create_info,
            p_allocator,
            p_device,
        )
    })
}

unsafe fn create_device_with_link<L: Layer>(
    physical_device: &Arc<PhysicalDeviceRecord>,
    link: DeviceLink,
    create_info: &vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> Result<(), LayerError> {
    let create = transmute::<_, Option<vk::PFN_vkCreateDevice>>(
        (link.get_instance_proc_addr)(
            physical_device.instance,
            c"vkCreateDevice".as_ptr(),
        )
    ).ok_or(LayerError::MissingFunction("vkCreateDevice"))?;

    let supported = supported_extensions::<L>(physical_device);

    let mut extension_names = slice_from_raw(
        create_info.pp_enabled_extension_names,
        create_info.enabled_extension_count,
    ).to_vec();
    let requested = DeviceExtensions::from_names(c_str_array(
        extension_names.as_ptr(),
        extension_names.len() as u32,
    ));

    if L::FORCE_MEMORY_BUDGET
        && supported.contains(
            DeviceExtensions::CORE_1_1 | DeviceExtensions::EXT_MEMORY_BUDGET
        )
        && !requested.contains(DeviceExtensions::EXT_MEMORY_BUDGET)
    {
        log::debug!("{}: enabling {:?}", L::LAYER_NAME, MEMORY_BUDGET_EXTENSION);
        extension_names.push(MEMORY_BUDGET_EXTENSION.as_ptr());
    }

    let mut local_create_info = *create_info;
    local_create_info.enabled_extension_count = extension_names.len() as u32;
    local_create_info.pp_enabled_extension_names = extension_names.as_ptr();

    check(create(
        physical_device.handle,
        &local_create_info,
        p_allocator,
        p_device,
    ))?;

    let device = *p_device;
    let funcs = DeviceFuncs::load(|name| {
        (link.get_device_proc_addr)(device, name.as_ptr())
    });
    let api_version = physical_device.properties()
        .map_or(0, |props| props.api_version);
    let enabled = DeviceExtensions::core_versions(
        physical_device.instance_extensions,
        api_version,
    ) | DeviceExtensions::from_names(c_str_array(
        extension_names.as_ptr(),
        extension_names.len() as u32,
    ));

    let with_budget = enabled.contains(DeviceExtensions::EXT_MEMORY_BUDGET);
    let needs_memory = {
        let state = lock(&physical_device.state);
        !state.memory.is_populated()
            || (with_budget && !state.memory.budget_updated)
    };

    if needs_memory {
        physical_device.refresh_memory(with_budget);
    }

    log::debug!("{}: {:?} with {:?}", L::LAYER_NAME, device, enabled);

    let record = Arc::new(DeviceRecord {
        handle: device,
        physical_device: Arc::clone(physical_device),
        get_device_proc_addr: link.get_device_proc_addr,
        funcs,
        enabled,
        config: physical_device.config,
        resources: Mutex::new(ResourceTables::new()),
        fences: Mutex::new(HandleMap::new()),
    });

    lock(&L::state().devices).insert(device, Arc::clone(&record));

    L::device_created(&record);

    Ok(())
}

pub unsafe extern "system" fn destroy_device<L: Layer>(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    log::trace!("{}: vkDestroyDevice", L::LAYER_NAME);

    let state = L::state();
    let Some(record) = state.device(device) else {
        return;
    };

    match record.funcs.vkDestroyDevice {
        Some(destroy) => destroy(device, p_allocator),
        None => {
            missing("vkDestroyDevice");
        },
    }

    state.forget_device(device);
}

// Resources

pub unsafe extern "system" fn create_buffer<L: Layer>(
    device: vk::Device,
    p_create_info: *const vk::BufferCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_buffer: *mut vk::Buffer,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(create) = record.funcs.vkCreateBuffer else {
        return missing("vkCreateBuffer");
    };

    let res = create(device, p_create_info, p_allocator, p_buffer);

    if res == vk::Result::SUCCESS {
        if let Some(create_info) = p_create_info.as_ref() {
            let info = BufferInfo::from_create_info(create_info);

            lock(&record.resources).add_buffer(
                *p_buffer,
                BufferRecord::new(create_info, info),
            );
        }
    }

    res
}

pub unsafe extern "system" fn destroy_buffer<L: Layer>(
    device: vk::Device,
    buffer: vk::Buffer,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };

    match record.funcs.vkDestroyBuffer {
        Some(destroy) => destroy(device, buffer, p_allocator),
        None => {
            missing("vkDestroyBuffer");
        },
    }

    if !buffer.is_null() {
        lock(&record.resources).destroy_buffer(buffer);
    }
}

pub unsafe extern "system" fn create_image<L: Layer>(
    device: vk::Device,
    p_create_info: *const vk::ImageCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_image: *mut vk::Image,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(create) = record.funcs.vkCreateImage else {
        return missing("vkCreateImage");
    };

    let res = create(device, p_create_info, p_allocator, p_image);

    if res == vk::Result::SUCCESS {
        if let Some(create_info) = p_create_info.as_ref() {
            let info = ImageInfo::from_create_info(create_info);

            lock(&record.resources).add_image(
                *p_image,
                ImageRecord::new(create_info, info),
            );
        }
    }

    res
}

pub unsafe extern "system" fn destroy_image<L: Layer>(
    device: vk::Device,
    image: vk::Image,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };

    match record.funcs.vkDestroyImage {
        Some(destroy) => destroy(device, image, p_allocator),
        None => {
            missing("vkDestroyImage");
        },
    }

    if !image.is_null() {
        lock(&record.resources).destroy_image(image);
    }
}

/// Allocates memory. When the simulator is limiting memory the
/// allocation is checked against the reduced size of its heap first
/// and refused without calling down if it doesn’t fit. The physical
/// device state stays locked across the call so that two allocations
/// can’t both fit in the space left for one.
pub unsafe extern "system" fn allocate_memory<L: Layer>(
    device: vk::Device,
    p_allocate_info: *const vk::MemoryAllocateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_memory: *mut vk::DeviceMemory,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(allocate) = record.funcs.vkAllocateMemory else {
        return missing("vkAllocateMemory");
    };
    let Some(allocate_info) = p_allocate_info.as_ref() else {
        return allocate(device, p_allocate_info, p_allocator, p_memory);
    };

    let config = record.config;
    let mut memory_record = MemoryRecord::new(
        allocate_info,
        MemoryInfo::from_allocate_info(allocate_info),
    );

    if !config.layer_enabled() || config.memory_percent >= 100 {
        let res = allocate(device, p_allocate_info, p_allocator, p_memory);

        if res == vk::Result::SUCCESS {
            lock(&record.resources).add_memory(*p_memory, memory_record);
        }

        return res;
    }

    let mut physical_state = lock(&record.physical_device.state);

    let heap = match physical_state.memory.admit(
        allocate_info.memory_type_index,
        allocate_info.allocation_size,
        config.memory_percent,
    ) {
        Ok(heap) => heap,
        Err(over) => {
            log::info!(
                "{}: refusing {} bytes from heap {}, {} of {} already used",
                L::LAYER_NAME,
                allocate_info.allocation_size,
                over.heap,
                over.allocated,
                over.limit,
            );
            return vk::Result::ERROR_OUT_OF_DEVICE_MEMORY;
        },
    };

    let res = allocate(device, p_allocate_info, p_allocator, p_memory);

    if res == vk::Result::SUCCESS {
        if let Some(heap) = heap {
            physical_state.memory.record_allocation(
                heap,
                allocate_info.allocation_size,
            );
        }

        memory_record.charged_heap = heap;
        lock(&record.resources).add_memory(*p_memory, memory_record);
    }

    res
}

pub unsafe extern "system" fn free_memory<L: Layer>(
    device: vk::Device,
    memory: vk::DeviceMemory,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };

    match record.funcs.vkFreeMemory {
        Some(free) => free(device, memory, p_allocator),
        None => {
            missing("vkFreeMemory");
        },
    }

    if memory.is_null() {
        return;
    }

    let freed = lock(&record.resources).free_memory(memory);

    if let Some(MemoryRecord {
        charged_heap: Some(heap),
        allocation_size,
        ..
    }) = freed {
        lock(&record.physical_device.state)
            .memory
            .record_free(heap, allocation_size);
    }
}

pub unsafe extern "system" fn bind_buffer_memory<L: Layer>(
    device: vk::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    memory_offset: vk::DeviceSize,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(bind) = record.funcs.vkBindBufferMemory else {
        return missing("vkBindBufferMemory");
    };

    let res = bind(device, buffer, memory, memory_offset);

    if res == vk::Result::SUCCESS && !buffer.is_null() {
        lock(&record.resources).bind_buffer(buffer, memory, memory_offset);
        record.physical_device.mark_budget_stale();
    }

    res
}

pub unsafe extern "system" fn bind_image_memory<L: Layer>(
    device: vk::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    memory_offset: vk::DeviceSize,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(bind) = record.funcs.vkBindImageMemory else {
        return missing("vkBindImageMemory");
    };

    let res = bind(device, image, memory, memory_offset);

    if res == vk::Result::SUCCESS && !image.is_null() {
        lock(&record.resources).bind_image(
            image,
            memory,
            memory_offset,
            ImageBindInfo::default(),
        );
        record.physical_device.mark_budget_stale();
    }

    res
}

pub unsafe extern "system" fn bind_buffer_memory2<L: Layer>(
    device: vk::Device,
    bind_info_count: u32,
    p_bind_infos: *const vk::BindBufferMemoryInfo,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(bind) = record.funcs.vkBindBufferMemory2 else {
        return missing("vkBindBufferMemory2");
    };

    let res = bind(device, bind_info_count, p_bind_infos);

    if res == vk::Result::SUCCESS {
        let infos = slice_from_raw(p_bind_infos, bind_info_count);

        {
            let mut resources = lock(&record.resources);

            for info in infos.iter().filter(|info| !info.buffer.is_null()) {
                resources.bind_buffer(info.buffer, info.memory, info.memory_offset);
            }
        }

        record.physical_device.mark_budget_stale();
    }

    res
}

pub unsafe extern "system" fn bind_image_memory2<L: Layer>(
    device: vk::Device,
    bind_info_count: u32,
    p_bind_infos: *const vk::BindImageMemoryInfo,
) -> vk::Result {
    let Some(record) = L::state().device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(bind) = record.funcs.vkBindImageMemory2 else {
        return missing("vkBindImageMemory2");
    };

    let res = bind(device, bind_info_count, p_bind_infos);

    if res == vk::Result::SUCCESS {
        let infos = slice_from_raw(p_bind_infos, bind_info_count);

        {
            let mut resources = lock(&record.resources);

            for info in infos.iter().filter(|info| !info.image.is_null()) {
                resources.bind_image(
                    info.image,
                    info.memory,
                    info.memory_offset,
                    ImageBindInfo::from_bind_info(info),
                );
            }
        }

        record.physical_device.mark_budget_stale();
    }

    res
}

pub unsafe extern "system" fn get_buffer_memory_requirements<L: Layer>(
    device: vk::Device,
    buffer: vk::Buffer,
    p_memory_requirements: *mut vk::MemoryRequirements,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetBufferMemoryRequirements else {
        missing("vkGetBufferMemoryRequirements");
        return;
    };

    get(device, buffer, p_memory_requirements);

    if let Some(requirements) = p_memory_requirements.as_ref() {
        lock(&record.resources).set_buffer_requirements(buffer, *requirements);
    }
}

pub unsafe extern "system" fn get_image_memory_requirements<L: Layer>(
    device: vk::Device,
    image: vk::Image,
    p_memory_requirements: *mut vk::MemoryRequirements,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetImageMemoryRequirements else {
        missing("vkGetImageMemoryRequirements");
        return;
    };

    get(device, image, p_memory_requirements);

    if let Some(requirements) = p_memory_requirements.as_ref() {
        lock(&record.resources).set_image_requirements(image, *requirements);
    }
}

pub unsafe extern "system" fn get_buffer_memory_requirements2<L: Layer>(
    device: vk::Device,
    p_info: *const vk::BufferMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetBufferMemoryRequirements2 else {
        missing("vkGetBufferMemoryRequirements2");
        return;
    };

    get(device, p_info, p_memory_requirements);

    if let (Some(info), Some(requirements)) =
        (p_info.as_ref(), p_memory_requirements.as_ref())
    {
        lock(&record.resources).set_buffer_requirements(
            info.buffer,
            requirements.memory_requirements,
        );
    }
}

pub unsafe extern "system" fn get_image_memory_requirements2<L: Layer>(
    device: vk::Device,
    p_info: *const vk::ImageMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetImageMemoryRequirements2 else {
        missing("vkGetImageMemoryRequirements2");
        return;
    };

    get(device, p_info, p_memory_requirements);

    if let (Some(info), Some(requirements)) =
        (p_info.as_ref(), p_memory_requirements.as_ref())
    {
        lock(&record.resources).set_image_requirements(
            info.image,
            requirements.memory_requirements,
        );
    }
}

// Queues

unsafe fn note_queue<L: Layer>(device: vk::Device, queue: vk::Queue) {
    if !queue.is_null() {
        lock(&L::state().queues).insert(queue, device);
    }
}

pub unsafe extern "system" fn get_device_queue<L: Layer>(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetDeviceQueue else {
        missing("vkGetDeviceQueue");
        return;
    };

    get(device, queue_family_index, queue_index, p_queue);

    if let Some(&queue) = p_queue.as_ref() {
        note_queue::<L>(device, queue);
    }
}

pub unsafe extern "system" fn get_device_queue2<L: Layer>(
    device: vk::Device,
    p_queue_info: *const vk::DeviceQueueInfo2,
    p_queue: *mut vk::Queue,
) {
    let Some(record) = L::state().device(device) else {
        return;
    };
    let Some(get) = record.funcs.vkGetDeviceQueue2 else {
        missing("vkGetDeviceQueue2");
        return;
    };

    get(device, p_queue_info, p_queue);

    if let Some(&queue) = p_queue.as_ref() {
        note_queue::<L>(device, queue);
    }
}

pub unsafe extern "system" fn queue_submit<L: Layer>(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo,
    fence: vk::Fence,
) -> vk::Result {
    let Some(record) = L::state().queue_device(queue) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(submit) = record.funcs.vkQueueSubmit else {
        return missing("vkQueueSubmit");
    };

    let res = submit(queue, submit_count, p_submits, fence);

    if res == vk::Result::SUCCESS {
        L::submitted(&record, fence);
    }

    res
}

unsafe fn submit2<L: Layer>(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
    khr: bool,
) -> vk::Result {
    let Some(record) = L::state().queue_device(queue) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let (first, second) = (
        record.funcs.vkQueueSubmit2,
        record.funcs.vkQueueSubmit2KHR,
    );
    let Some(submit) = (if khr { second.or(first) } else { first.or(second) })
    else {
        return missing("vkQueueSubmit2");
    };

    let res = submit(queue, submit_count, p_submits, fence);

    if res == vk::Result::SUCCESS {
        L::submitted(&record, fence);
    }

    res
}

pub unsafe extern "system" fn queue_submit2<L: Layer>(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    submit2::<L>(queue, submit_count, p_submits, fence, false)
}

pub unsafe extern "system" fn queue_submit2_khr<L: Layer>(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    submit2::<L>(queue, submit_count, p_submits, fence, true)
}

// External memory

pub unsafe extern "system" fn get_memory_fd_properties<L: Layer>(
    device: vk::Device,
    handle_type: vk::ExternalMemoryHandleTypeFlags,
    fd: c_int,
    p_memory_fd_properties: *mut vk::MemoryFdPropertiesKHR,
) -> vk::Result {
    let state = L::state();
    let Some(record) = state.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(get) = record.funcs.vkGetMemoryFdPropertiesKHR else {
        return missing("vkGetMemoryFdPropertiesKHR");
    };

    let res = get(device, handle_type, fd, p_memory_fd_properties);

    if res == vk::Result::SUCCESS {
        if let Some(props) = p_memory_fd_properties.as_ref() {
            let mut fds = lock(&state.external_fds);

            // The fd number can be reused once the old one is closed
            fds.erase(fd);
            fds.insert(
                fd,
                ExternalMemoryRecord {
                    device,
                    memory_type_bits: props.memory_type_bits,
                    allocation_size: 0,
                },
            );
        }
    }

    res
}

pub unsafe extern "system" fn get_android_hardware_buffer_properties<
    L: Layer
>(
    device: vk::Device,
    buffer: *const vk::AHardwareBuffer,
    p_properties: *mut vk::AndroidHardwareBufferPropertiesANDROID,
) -> vk::Result {
    let state = L::state();
    let Some(record) = state.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(get) = record.funcs.vkGetAndroidHardwareBufferPropertiesANDROID
    else {
        return missing("vkGetAndroidHardwareBufferPropertiesANDROID");
    };

    let res = get(device, buffer, p_properties);

    if res == vk::Result::SUCCESS {
        if let Some(props) = p_properties.as_ref() {
            let mut buffers = lock(&state.android_buffers);
            let key = buffer as usize;

            buffers.erase(key);
            buffers.insert(
                key,
                ExternalMemoryRecord {
                    device,
                    memory_type_bits: props.memory_type_bits,
                    allocation_size: props.allocation_size,
                },
            );
        }
    }

    res
}

// Function resolution

/// The instance-level commands that are always resolved, even without
/// an instance.
fn instance_commands<L: Layer>(name: &[u8]) -> vk::PFN_vkVoidFunction {
    proc_table!(name => {
        b"vkGetInstanceProcAddr" =>
            get_instance_proc_addr::<L>: PFN_vkGetInstanceProcAddr,
        b"vkCreateInstance" => create_instance::<L>: PFN_vkCreateInstance,
        b"vkDestroyInstance" => destroy_instance::<L>: PFN_vkDestroyInstance,
        b"vkCreateDevice" => create_device::<L>: PFN_vkCreateDevice,
        b"vkEnumeratePhysicalDevices" =>
            enumerate_physical_devices::<L>: PFN_vkEnumeratePhysicalDevices,
        b"vkEnumerateInstanceLayerProperties" =>
            enumerate_instance_layer_properties::<L>:
            PFN_vkEnumerateInstanceLayerProperties,
        b"vkEnumerateInstanceExtensionProperties" =>
            enumerate_instance_extension_properties::<L>:
            PFN_vkEnumerateInstanceExtensionProperties,
        b"vkEnumerateDeviceLayerProperties" =>
            enumerate_device_layer_properties::<L>:
            PFN_vkEnumerateDeviceLayerProperties,
        b"vkEnumerateDeviceExtensionProperties" =>
            enumerate_device_extension_properties::<L>:
            PFN_vkEnumerateDeviceExtensionProperties,
        b"vkGetPhysicalDeviceProperties" =>
            get_physical_device_properties::<L>:
            PFN_vkGetPhysicalDeviceProperties,
        b"vkGetPhysicalDeviceMemoryProperties" =>
            get_physical_device_memory_properties::<L>:
            PFN_vkGetPhysicalDeviceMemoryProperties,
        b"vkGetPhysicalDeviceToolPropertiesEXT" =>
            get_physical_device_tool_properties_ext::<L>:
            PFN_vkGetPhysicalDeviceToolProperties,
    })
}

fn instance_version_commands<L: Layer>(
    enabled: InstanceExtensions,
    name: &[u8],
) -> vk::PFN_vkVoidFunction {
    if enabled.contains(InstanceExtensions::CORE_1_1) {
        let func = proc_table!(name => {
            b"vkEnumeratePhysicalDeviceGroups" =>
                enumerate_physical_device_groups::<L>:
                PFN_vkEnumeratePhysicalDeviceGroups,
            b"vkGetPhysicalDeviceProperties2" =>
                get_physical_device_properties2::<L>:
                PFN_vkGetPhysicalDeviceProperties2,
            b"vkGetPhysicalDeviceMemoryProperties2" =>
                get_physical_device_memory_properties2::<L>:
                PFN_vkGetPhysicalDeviceMemoryProperties2,
            b"vkGetPhysicalDeviceExternalBufferProperties" =>
                get_physical_device_external_buffer_properties::<L>:
                PFN_vkGetPhysicalDeviceExternalBufferProperties,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(InstanceExtensions::CORE_1_3) {
        let func = proc_table!(name => {
            b"vkGetPhysicalDeviceToolProperties" =>
                get_physical_device_tool_properties::<L>:
                PFN_vkGetPhysicalDeviceToolProperties,
        });

        if func.is_some() {
            return func;
        }
    }

    None
}

fn instance_extension_commands<L: Layer>(
    enabled: InstanceExtensions,
    name: &[u8],
) -> vk::PFN_vkVoidFunction {
    if enabled.contains(InstanceExtensions::KHR_DEVICE_GROUP_CREATION) {
        let func = proc_table!(name => {
            b"vkEnumeratePhysicalDeviceGroupsKHR" =>
                enumerate_physical_device_groups_khr::<L>:
                PFN_vkEnumeratePhysicalDeviceGroups,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(InstanceExtensions::KHR_EXTERNAL_MEMORY_CAPABILITIES) {
        let func = proc_table!(name => {
            b"vkGetPhysicalDeviceExternalBufferPropertiesKHR" =>
                get_physical_device_external_buffer_properties_khr::<L>:
                PFN_vkGetPhysicalDeviceExternalBufferProperties,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(InstanceExtensions::KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2) {
        let func = proc_table!(name => {
            b"vkGetPhysicalDeviceProperties2KHR" =>
                get_physical_device_properties2_khr::<L>:
                PFN_vkGetPhysicalDeviceProperties2,
            b"vkGetPhysicalDeviceMemoryProperties2KHR" =>
                get_physical_device_memory_properties2_khr::<L>:
                PFN_vkGetPhysicalDeviceMemoryProperties2,
        });

        if func.is_some() {
            return func;
        }
    }

    None
}

/// The device-level commands that both layers always intercept.
pub fn shared_device_commands<L: Layer>(name: &[u8]) -> vk::PFN_vkVoidFunction {
    proc_table!(name => {
        b"vkGetDeviceProcAddr" =>
            get_device_proc_addr::<L>: PFN_vkGetDeviceProcAddr,
        b"vkDestroyDevice" => destroy_device::<L>: PFN_vkDestroyDevice,
        b"vkCreateBuffer" => create_buffer::<L>: PFN_vkCreateBuffer,
        b"vkDestroyBuffer" => destroy_buffer::<L>: PFN_vkDestroyBuffer,
        b"vkCreateImage" => create_image::<L>: PFN_vkCreateImage,
        b"vkDestroyImage" => destroy_image::<L>: PFN_vkDestroyImage,
        b"vkAllocateMemory" => allocate_memory::<L>: PFN_vkAllocateMemory,
        b"vkFreeMemory" => free_memory::<L>: PFN_vkFreeMemory,
        b"vkBindBufferMemory" =>
            bind_buffer_memory::<L>: PFN_vkBindBufferMemory,
        b"vkBindImageMemory" => bind_image_memory::<L>: PFN_vkBindImageMemory,
        b"vkGetBufferMemoryRequirements" =>
            get_buffer_memory_requirements::<L>:
            PFN_vkGetBufferMemoryRequirements,
        b"vkGetImageMemoryRequirements" =>
            get_image_memory_requirements::<L>:
            PFN_vkGetImageMemoryRequirements,
        b"vkGetDeviceQueue" => get_device_queue::<L>: PFN_vkGetDeviceQueue,
        b"vkQueueSubmit" => queue_submit::<L>: PFN_vkQueueSubmit,
    })
}

/// The device-level commands of both layers that need a core version
/// or an extension.
pub fn shared_device_extension_commands<L: Layer>(
    enabled: DeviceExtensions,
    name: &[u8],
) -> vk::PFN_vkVoidFunction {
    if enabled.contains(DeviceExtensions::CORE_1_1) {
        let func = proc_table!(name => {
            b"vkBindBufferMemory2" =>
                bind_buffer_memory2::<L>: PFN_vkBindBufferMemory2,
            b"vkBindImageMemory2" =>
                bind_image_memory2::<L>: PFN_vkBindImageMemory2,
            b"vkGetBufferMemoryRequirements2" =>
                get_buffer_memory_requirements2::<L>:
                PFN_vkGetBufferMemoryRequirements2,
            b"vkGetImageMemoryRequirements2" =>
                get_image_memory_requirements2::<L>:
                PFN_vkGetImageMemoryRequirements2,
            b"vkGetDeviceQueue2" =>
                get_device_queue2::<L>: PFN_vkGetDeviceQueue2,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(DeviceExtensions::CORE_1_3) {
        let func = proc_table!(name => {
            b"vkQueueSubmit2" => queue_submit2::<L>: PFN_vkQueueSubmit2,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(DeviceExtensions::KHR_SYNCHRONIZATION_2) {
        let func = proc_table!(name => {
            b"vkQueueSubmit2KHR" => queue_submit2_khr::<L>: PFN_vkQueueSubmit2,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(DeviceExtensions::KHR_EXTERNAL_MEMORY_FD) {
        let func = proc_table!(name => {
            b"vkGetMemoryFdPropertiesKHR" =>
                get_memory_fd_properties::<L>: PFN_vkGetMemoryFdPropertiesKHR,
        });

        if func.is_some() {
            return func;
        }
    }

    if enabled.contains(DeviceExtensions::ANDROID_EXTERNAL_MEMORY_HARDWARE_BUFFER)
    {
        let func = proc_table!(name => {
            b"vkGetAndroidHardwareBufferPropertiesANDROID" =>
                get_android_hardware_buffer_properties::<L>:
                PFN_vkGetAndroidHardwareBufferPropertiesANDROID,
        });

        if func.is_some() {
            return func;
        }
    }

    None
}

pub unsafe extern "system" fn get_instance_proc_addr<L: Layer>(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }

    let name = CStr::from_ptr(p_name).to_bytes();

    if let func @ Some(_) = instance_commands::<L>(name) {
        return func;
    }

    if instance.is_null() {
        return None;
    }

    let Some(record) = L::state().instance(instance) else {
        return None;
    };

    instance_version_commands::<L>(record.extensions, name)
        .or_else(|| instance_extension_commands::<L>(record.extensions, name))
        .or_else(|| L::device_commands(name))
        .or_else(|| (record.get_instance_proc_addr)(instance, p_name))
}

pub unsafe extern "system" fn get_device_proc_addr<L: Layer>(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }

    let name = CStr::from_ptr(p_name).to_bytes();

    if let func @ Some(_) = L::device_commands(name) {
        return func;
    }

    let Some(record) = L::state().device(device) else {
        return None;
    };

    L::device_extension_commands(record.enabled, name)
        .or_else(|| (record.get_device_proc_addr)(device, p_name))
}

pub unsafe extern "system" fn negotiate_loader_layer_interface_version<
    L: Layer
>(
    p_version_struct: *mut vk::NegotiateLayerInterface,
) -> vk::Result {
    let Some(version_struct) = p_version_struct.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    if version_struct.s_type != vk::LAYER_NEGOTIATE_INTERFACE_STRUCT {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    if version_struct.loader_layer_interface_version >= 2 {
        version_struct.pfn_get_instance_proc_addr =
            Some(get_instance_proc_addr::<L>);
        version_struct.pfn_get_device_proc_addr =
            Some(get_device_proc_addr::<L>);
        version_struct.pfn_get_physical_device_proc_addr = None;
    }

    version_struct.loader_layer_interface_version =
        version_struct.loader_layer_interface_version
        .min(vk::CURRENT_LOADER_LAYER_INTERFACE_VERSION);

    vk::Result::SUCCESS
}
