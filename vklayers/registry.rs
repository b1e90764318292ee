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

//! Keyed storage for the shadow records of every tracked Vulkan
//! object. Handles are only used as identity tokens and are never
//! dereferenced.

use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::hash::Hash;

/// A map from a Vulkan handle to the layer’s record for it.
pub struct HandleMap<H, R> {
    records: HashMap<H, R>,
}

impl<H, R> Default for HandleMap<H, R> {
    fn default() -> HandleMap<H, R> {
        HandleMap { records: HashMap::new() }
    }
}

impl<H: fmt::Debug, R: fmt::Debug> fmt::Debug for HandleMap<H, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.records.iter()).finish()
    }
}

impl<H, R> HandleMap<H, R>
where
    H: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new() -> HandleMap<H, R> {
        HandleMap::default()
    }

    /// Adds a record for a handle. If the handle already has a live
    /// record then the existing one is kept and `false` is returned.
    /// That can only happen if an object was destroyed without the
    /// call going through this layer.
    pub fn insert(&mut self, handle: H, record: R) -> bool {
        match self.records.entry(handle) {
            hash_map::Entry::Occupied(_) => {
                log::warn!("{:?} is already being tracked", handle);
                false
            },
            hash_map::Entry::Vacant(entry) => {
                entry.insert(record);
                true
            },
        }
    }

    pub fn get(&self, handle: H) -> Option<&R> {
        self.records.get(&handle)
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut R> {
        self.records.get_mut(&handle)
    }

    pub fn contains(&self, handle: H) -> bool {
        self.records.contains_key(&handle)
    }

    /// Removes the record for the handle and returns it. Erasing a
    /// handle that isn’t in the map does nothing.
    pub fn erase(&mut self, handle: H) -> Option<R> {
        self.records.remove(&handle)
    }

    /// Removes every record for which `pred` returns true and returns
    /// the removed records. This is used to cascade the destruction
    /// of a parent object to all of its children.
    pub fn erase_where<F>(&mut self, mut pred: F) -> Vec<(H, R)>
    where
        F: FnMut(H, &R) -> bool,
    {
        let doomed = self.records
            .iter()
            .filter(|&(&handle, record)| pred(handle, record))
            .map(|(&handle, _)| handle)
            .collect::<Vec<H>>();

        doomed
            .into_iter()
            .filter_map(|handle| {
                self.records.remove(&handle).map(|record| (handle, record))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &R)> {
        self.records.iter().map(|(&handle, record)| (handle, record))
    }

    pub fn handles(&self) -> impl Iterator<Item = H> + '_ {
        self.records.keys().copied()
    }
}
