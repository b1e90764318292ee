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

use crate::vk;
use std::borrow::Cow;
use std::cmp::min;
use std::env;
use std::ffi::{c_char, CStr, OsStr};

/// Reads an environment variable and interprets its value as a boolean.
///
/// Recognizes 0/false/no and 1/true/yes. Other values result in the
/// default value.
pub fn env_var_as_boolean<K: AsRef<OsStr>>(
    var_name: K,
    default_value: bool,
) -> bool {
    match env::var(var_name) {
        Ok(value) => match value.as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default_value,
        },
        Err(_) => default_value,
    }
}

/// Copies `s` into one of the fixed-size C string arrays used by the
/// Vulkan property structs. The string is truncated if needed so
/// that there is always room for the null terminator.
pub fn copy_to_c_array(dst: &mut [c_char], s: &str) {
    if dst.is_empty() {
        return;
    }

    let len = min(dst.len() - 1, s.len());

    for (d, &b) in dst.iter_mut().zip(s.as_bytes()[..len].iter()) {
        *d = b as c_char;
    }

    dst[len] = 0;
}

/// Reads a fixed-size C string array. If there is no terminator the
/// whole array is used. Bytes that aren’t valid UTF-8 are replaced.
pub fn c_array_to_str(src: &[c_char]) -> Cow<'_, str> {
    // SAFETY: c_char and u8 have the same size and alignment
    let bytes = unsafe {
        std::slice::from_raw_parts(src.as_ptr().cast::<u8>(), src.len())
    };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());

    String::from_utf8_lossy(&bytes[..len])
}

/// Gets a slice from a Vulkan count and pointer pair. A null pointer
/// or a zero count gives an empty slice.
///
/// # Safety
///
/// If `ptr` isn’t null it must point to at least `count` valid
/// elements that outlive the returned slice.
pub unsafe fn slice_from_raw<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count as usize)
    }
}

/// Iterates the names in a `ppEnabledExtensionNames` style array.
///
/// # Safety
///
/// Same requirements as [slice_from_raw] and each pointer must be a
/// valid null-terminated string.
pub unsafe fn c_str_array<'a>(
    names: *const *const c_char,
    count: u32,
) -> impl Iterator<Item = &'a CStr> {
    slice_from_raw(names, count)
        .iter()
        .filter(|name| !name.is_null())
        .map(|&name| CStr::from_ptr(name))
}

/// Implements the usual Vulkan two-call idiom for returning an array.
/// If `array_ptr` is null then the number of values is written to
/// `count_ptr`. Otherwise as many values as fit are copied and
/// `VK_INCOMPLETE` is returned if not all of them did.
///
/// # Safety
///
/// `count_ptr` must be valid and if `array_ptr` isn’t null it must
/// have room for `*count_ptr` elements.
pub unsafe fn copy_with_count<T: Clone>(
    values: &[T],
    count_ptr: *mut u32,
    array_ptr: *mut T,
) -> vk::Result {
    if count_ptr.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    if array_ptr.is_null() {
        *count_ptr = values.len() as u32;
        return vk::Result::SUCCESS;
    }

    let count = min(*count_ptr as usize, values.len());

    for (i, value) in values.iter().take(count).enumerate() {
        *array_ptr.add(i) = value.clone();
    }

    *count_ptr = count as u32;

    if count < values.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_env_var_value<V: AsRef<OsStr>>(
        value: V,
        default_value: bool,
        expected_result: bool
    ) {
        const TEST_VAR: &'static str = "VKLAYERS_TEST_ENV_VAR";
        let _lock = crate::env_var_test::EnvVarLock::new(&[
            (TEST_VAR, value),
        ]);
        assert_eq!(
            env_var_as_boolean(TEST_VAR, default_value),
            expected_result
        );
    }

    #[test]
    fn test_env_var_as_boolean() {
        test_env_var_value("1", false, true);
        test_env_var_value("yes", false, true);
        test_env_var_value("0", true, false);
        test_env_var_value("no", true, false);
        test_env_var_value("maybe", false, false);
        test_env_var_value("maybe", true, true);

        assert!(env_var_as_boolean("VKLAYERS_VARIABLE_THAT_ISNT_SET", true));
        assert!(!env_var_as_boolean("VKLAYERS_VARIABLE_THAT_ISNT_SET", false));
    }

    #[test]
    fn c_array_round_trip() {
        let mut name = [0 as c_char; 8];

        copy_to_c_array(&mut name, "memory");
        assert_eq!(c_array_to_str(&name), "memory");

        // Too long so it gets truncated to leave room for the terminator
        copy_to_c_array(&mut name, "memory_tracker");
        assert_eq!(c_array_to_str(&name), "memory_");
        assert_eq!(name[7], 0);
    }

    #[test]
    fn copy_count_only() {
        let values = [1u32, 2, 3];
        let mut count = 0;

        let res = unsafe {
            copy_with_count(&values, &mut count, std::ptr::null_mut())
        };

        assert_eq!(res, vk::Result::SUCCESS);
        assert_eq!(count, 3);
    }

    #[test]
    fn copy_truncated() {
        let values = [1u32, 2, 3];
        let mut out = [0u32; 2];
        let mut count = 2;

        let res = unsafe {
            copy_with_count(&values, &mut count, out.as_mut_ptr())
        };

        assert_eq!(res, vk::Result::INCOMPLETE);
        assert_eq!(count, 2);
        assert_eq!(out, [1, 2]);

        let mut out = [0u32; 4];
        let mut count = 4;

        let res = unsafe {
            copy_with_count(&values, &mut count, out.as_mut_ptr())
        };

        assert_eq!(res, vk::Result::SUCCESS);
        assert_eq!(count, 3);
        assert_eq!(&out[0..3], &values);
    }
}
