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
use std::fmt;

/// Errors that can happen while setting up the call chain or while
/// forwarding a call to the next layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    /// The create-info didn’t contain the loader’s link info for
    /// this layer.
    MissingLinkInfo,
    /// The next layer couldn’t provide a function that we need.
    MissingFunction(&'static str),
    /// A call to the next layer failed.
    Vulkan(vk::Result),
}

impl LayerError {
    /// The result that should be reported to the application for
    /// this error.
    pub fn result(&self) -> vk::Result {
        match self {
            LayerError::MissingLinkInfo
                | LayerError::MissingFunction(_) => {
                    vk::Result::ERROR_INITIALIZATION_FAILED
                },
            LayerError::Vulkan(res) => *res,
        }
    }
}

impl From<vk::Result> for LayerError {
    fn from(res: vk::Result) -> LayerError {
        LayerError::Vulkan(res)
    }
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LayerError::MissingLinkInfo => {
                write!(f, "The loader’s layer link info is missing")
            },
            LayerError::MissingFunction(name) => {
                write!(f, "The next layer doesn’t provide {}", name)
            },
            LayerError::Vulkan(res) => {
                write!(f, "The next layer returned {:?}", res)
            },
        }
    }
}

/// Converts a vulkan result code into a `Result` so that it can be
/// used with the `?` operator.
pub fn check(res: vk::Result) -> Result<(), LayerError> {
    match res {
        vk::Result::SUCCESS => Ok(()),
        other => Err(LayerError::Vulkan(other)),
    }
}

/// Runs `f` and converts its return value back into a vulkan result
/// for the `extern "system"` boundary.
pub fn to_vk_result<F>(f: F) -> vk::Result
where
    F: FnOnce() -> Result<(), LayerError>
{
    match f() {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => {
            if !matches!(e, LayerError::Vulkan(_)) {
                log::error!("{}", e);
            }
            e.result()
        },
    }
}
