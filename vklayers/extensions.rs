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

//! Flags recording which core versions and extensions were enabled
//! for an instance or are supported/enabled for a device. Entry points
//! from a versioned or extension group are only advertised when the
//! corresponding flag is set.

use bitflags::bitflags;
use crate::vk;
use std::ffi::CStr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstanceExtensions: u32 {
        const CORE_1_1 = 1 << 0;
        const CORE_1_2 = 1 << 1;
        const CORE_1_3 = 1 << 2;
        const KHR_DEVICE_GROUP_CREATION = 1 << 3;
        const KHR_EXTERNAL_MEMORY_CAPABILITIES = 1 << 4;
        const KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2 = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceExtensions: u32 {
        const CORE_1_1 = 1 << 0;
        const CORE_1_2 = 1 << 1;
        const CORE_1_3 = 1 << 2;
        const KHR_SYNCHRONIZATION_2 = 1 << 3;
        const KHR_EXTERNAL_MEMORY_FD = 1 << 4;
        const KHR_SWAPCHAIN = 1 << 5;
        const EXT_DISPLAY_CONTROL = 1 << 6;
        const EXT_MEMORY_BUDGET = 1 << 7;
        const EXT_SWAPCHAIN_MAINTENANCE_1 = 1 << 8;
        const ANDROID_EXTERNAL_MEMORY_HARDWARE_BUFFER = 1 << 9;
    }
}

pub const MEMORY_BUDGET_EXTENSION: &CStr = c"VK_EXT_memory_budget";

static INSTANCE_EXTENSION_NAMES: [(&CStr, InstanceExtensions); 3] = [
    (
        c"VK_KHR_device_group_creation",
        InstanceExtensions::KHR_DEVICE_GROUP_CREATION,
    ),
    (
        c"VK_KHR_external_memory_capabilities",
        InstanceExtensions::KHR_EXTERNAL_MEMORY_CAPABILITIES,
    ),
    (
        c"VK_KHR_get_physical_device_properties2",
        InstanceExtensions::KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2,
    ),
];

static DEVICE_EXTENSION_NAMES: [(&CStr, DeviceExtensions); 7] = [
    (c"VK_KHR_synchronization2", DeviceExtensions::KHR_SYNCHRONIZATION_2),
    (c"VK_KHR_external_memory_fd", DeviceExtensions::KHR_EXTERNAL_MEMORY_FD),
    (c"VK_KHR_swapchain", DeviceExtensions::KHR_SWAPCHAIN),
    (c"VK_EXT_display_control", DeviceExtensions::EXT_DISPLAY_CONTROL),
    (MEMORY_BUDGET_EXTENSION, DeviceExtensions::EXT_MEMORY_BUDGET),
    (
        c"VK_EXT_swapchain_maintenance1",
        DeviceExtensions::EXT_SWAPCHAIN_MAINTENANCE_1,
    ),
    (
        c"VK_ANDROID_external_memory_android_hardware_buffer",
        DeviceExtensions::ANDROID_EXTERNAL_MEMORY_HARDWARE_BUFFER,
    ),
];

impl InstanceExtensions {
    /// Flags for the core versions that an API version implies. Only
    /// the minor number is considered.
    pub fn from_api_version(api_version: u32) -> InstanceExtensions {
        let mut flags = InstanceExtensions::empty();

        if api_version == 0 {
            return flags;
        }

        let minor = vk::api_version_minor(api_version);

        flags.set(InstanceExtensions::CORE_1_1, minor > 0);
        flags.set(InstanceExtensions::CORE_1_2, minor > 1);
        flags.set(InstanceExtensions::CORE_1_3, minor > 2);

        flags
    }

    pub fn from_extension_name(name: &CStr) -> InstanceExtensions {
        INSTANCE_EXTENSION_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, flag)| flag)
            .unwrap_or(InstanceExtensions::empty())
    }

    /// The flags for an instance created with the given API version
    /// and the given list of enabled extensions.
    pub fn from_create_info<'a, I>(
        api_version: u32,
        enabled_extensions: I,
    ) -> InstanceExtensions
    where
        I: IntoIterator<Item = &'a CStr>,
    {
        enabled_extensions
            .into_iter()
            .fold(
                InstanceExtensions::from_api_version(api_version),
                |flags, name| {
                    flags | InstanceExtensions::from_extension_name(name)
                },
            )
    }
}

impl DeviceExtensions {
    pub fn from_extension_name(name: &CStr) -> DeviceExtensions {
        DEVICE_EXTENSION_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, flag)| flag)
            .unwrap_or(DeviceExtensions::empty())
    }

    pub fn from_names<'a, I>(names: I) -> DeviceExtensions
    where
        I: IntoIterator<Item = &'a CStr>,
    {
        names
            .into_iter()
            .fold(DeviceExtensions::empty(), |flags, name| {
                flags | DeviceExtensions::from_extension_name(name)
            })
    }

    /// The core versions a device can expose. A version is only
    /// available if the instance enabled it and the physical device’s
    /// API version is new enough.
    pub fn core_versions(
        instance: InstanceExtensions,
        device_api_version: u32,
    ) -> DeviceExtensions {
        let minor = vk::api_version_minor(device_api_version);
        let mut flags = DeviceExtensions::empty();

        flags.set(
            DeviceExtensions::CORE_1_1,
            instance.contains(InstanceExtensions::CORE_1_1) && minor > 0,
        );
        flags.set(
            DeviceExtensions::CORE_1_2,
            instance.contains(InstanceExtensions::CORE_1_2) && minor > 1,
        );
        flags.set(
            DeviceExtensions::CORE_1_3,
            instance.contains(InstanceExtensions::CORE_1_3) && minor > 2,
        );

        flags
    }
}
