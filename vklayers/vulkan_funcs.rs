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

//! Tables of the next layer’s functions. The instance table is filled
//! in once the instance has been created and the device table once
//! the device has been created. Any function that the next layer
//! doesn’t provide is left as `None` and the entry points that need it
//! report an error instead of calling through a null pointer.

use crate::vk;
use std::ffi::CStr;

macro_rules! vulkan_funcs {
    ($name:ident { $($func:ident : $ty:ident,)* }) => {
        #[allow(non_snake_case)]
        #[derive(Clone, Copy, Default)]
        pub struct $name {
            $(pub $func: Option<vk::$ty>,)*
        }

        impl $name {
            /// Resolves every function in the table with `resolve`.
            ///
            /// # Safety
            ///
            /// `resolve` must return either null or a pointer to a
            /// function with the signature matching the name.
            pub unsafe fn load<F>(mut resolve: F) -> $name
            where
                F: FnMut(&CStr) -> vk::PFN_vkVoidFunction,
            {
                $name {
                    $(
                        $func: std::mem::transmute::<
                            vk::PFN_vkVoidFunction,
                            Option<vk::$ty>,
                        >(resolve(CStr::from_bytes_with_nul_unchecked(
                            concat!(stringify!($func), "\0").as_bytes()
                        ))),
                    )*
                }
            }
        }
    };
}

// Aliases of promoted commands use the type of the core command
// because the signatures are identical.
vulkan_funcs! {
    InstanceFuncs {
        vkDestroyInstance: PFN_vkDestroyInstance,
        vkEnumeratePhysicalDevices: PFN_vkEnumeratePhysicalDevices,
        vkEnumeratePhysicalDeviceGroups: PFN_vkEnumeratePhysicalDeviceGroups,
        vkEnumeratePhysicalDeviceGroupsKHR: PFN_vkEnumeratePhysicalDeviceGroups,
        vkEnumerateDeviceExtensionProperties:
            PFN_vkEnumerateDeviceExtensionProperties,
        vkGetPhysicalDeviceProperties: PFN_vkGetPhysicalDeviceProperties,
        vkGetPhysicalDeviceProperties2: PFN_vkGetPhysicalDeviceProperties2,
        vkGetPhysicalDeviceProperties2KHR: PFN_vkGetPhysicalDeviceProperties2,
        vkGetPhysicalDeviceMemoryProperties:
            PFN_vkGetPhysicalDeviceMemoryProperties,
        vkGetPhysicalDeviceMemoryProperties2:
            PFN_vkGetPhysicalDeviceMemoryProperties2,
        vkGetPhysicalDeviceMemoryProperties2KHR:
            PFN_vkGetPhysicalDeviceMemoryProperties2,
        vkGetPhysicalDeviceToolProperties:
            PFN_vkGetPhysicalDeviceToolProperties,
        vkGetPhysicalDeviceToolPropertiesEXT:
            PFN_vkGetPhysicalDeviceToolProperties,
        vkGetPhysicalDeviceExternalBufferProperties:
            PFN_vkGetPhysicalDeviceExternalBufferProperties,
        vkGetPhysicalDeviceExternalBufferPropertiesKHR:
            PFN_vkGetPhysicalDeviceExternalBufferProperties,
    }
}

vulkan_funcs! {
    DeviceFuncs {
        vkDestroyDevice: PFN_vkDestroyDevice,
        vkCreateBuffer: PFN_vkCreateBuffer,
        vkDestroyBuffer: PFN_vkDestroyBuffer,
        vkCreateImage: PFN_vkCreateImage,
        vkDestroyImage: PFN_vkDestroyImage,
        vkAllocateMemory: PFN_vkAllocateMemory,
        vkFreeMemory: PFN_vkFreeMemory,
        vkBindBufferMemory: PFN_vkBindBufferMemory,
        vkBindImageMemory: PFN_vkBindImageMemory,
        vkBindBufferMemory2: PFN_vkBindBufferMemory2,
        vkBindImageMemory2: PFN_vkBindImageMemory2,
        vkGetBufferMemoryRequirements: PFN_vkGetBufferMemoryRequirements,
        vkGetImageMemoryRequirements: PFN_vkGetImageMemoryRequirements,
        vkGetBufferMemoryRequirements2: PFN_vkGetBufferMemoryRequirements2,
        vkGetImageMemoryRequirements2: PFN_vkGetImageMemoryRequirements2,
        vkGetImageSparseMemoryRequirements:
            PFN_vkGetImageSparseMemoryRequirements,
        vkGetDeviceBufferMemoryRequirements:
            PFN_vkGetDeviceBufferMemoryRequirements,
        vkGetDeviceImageMemoryRequirements:
            PFN_vkGetDeviceImageMemoryRequirements,
        vkGetDeviceBufferMemoryRequirementsKHR:
            PFN_vkGetDeviceBufferMemoryRequirements,
        vkGetDeviceImageMemoryRequirementsKHR:
            PFN_vkGetDeviceImageMemoryRequirements,
        vkGetDeviceQueue: PFN_vkGetDeviceQueue,
        vkGetDeviceQueue2: PFN_vkGetDeviceQueue2,
        vkQueueSubmit: PFN_vkQueueSubmit,
        vkQueueSubmit2: PFN_vkQueueSubmit2,
        vkQueueSubmit2KHR: PFN_vkQueueSubmit2,
        vkQueueBindSparse: PFN_vkQueueBindSparse,
        vkCreateFence: PFN_vkCreateFence,
        vkDestroyFence: PFN_vkDestroyFence,
        vkResetFences: PFN_vkResetFences,
        vkGetFenceStatus: PFN_vkGetFenceStatus,
        vkWaitForFences: PFN_vkWaitForFences,
        vkGetMemoryFdPropertiesKHR: PFN_vkGetMemoryFdPropertiesKHR,
        vkAcquireNextImageKHR: PFN_vkAcquireNextImageKHR,
        vkAcquireNextImage2KHR: PFN_vkAcquireNextImage2KHR,
        vkQueuePresentKHR: PFN_vkQueuePresentKHR,
        vkRegisterDeviceEventEXT: PFN_vkRegisterDeviceEventEXT,
        vkRegisterDisplayEventEXT: PFN_vkRegisterDisplayEventEXT,
        vkGetAndroidHardwareBufferPropertiesANDROID:
            PFN_vkGetAndroidHardwareBufferPropertiesANDROID,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::ffi::c_char;

    unsafe extern "system" fn destroy_instance(
        _instance: vk::Instance,
        _allocator: *const vk::AllocationCallbacks,
    ) {
    }

    #[test]
    fn load_by_name() {
        let mut names = Vec::new();

        let funcs = unsafe {
            InstanceFuncs::load(|name| {
                names.push(name.to_str().unwrap().to_string());

                if name == c"vkDestroyInstance" {
                    std::mem::transmute::<vk::PFN_vkDestroyInstance, _>(
                        destroy_instance
                    )
                } else {
                    None
                }
            })
        };

        assert!(funcs.vkDestroyInstance.is_some());
        assert!(funcs.vkEnumeratePhysicalDevices.is_none());
        assert!(names.iter().any(|n| n == "vkGetPhysicalDeviceProperties2KHR"));
        assert_eq!(names.len(), 15);

        // Every name must be null-terminated for the C resolver
        let funcs = unsafe {
            DeviceFuncs::load(|name| {
                let ptr: *const c_char = name.as_ptr();
                assert_eq!(*ptr.add(name.to_bytes().len()), 0);
                None
            })
        };
        assert!(funcs.vkQueueSubmit.is_none());
    }
}
