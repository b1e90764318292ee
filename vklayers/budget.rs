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

//! Cached copy of a physical device’s memory heaps and types along
//! with the budget and usage reported by `VK_EXT_memory_budget`. The
//! slow device simulator also uses it to account for the memory it
//! has let the application allocate.

use crate::vk;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub size: vk::DeviceSize,
    pub flags: vk::MemoryHeapFlags,
    /// Zero when the budget is unknown.
    pub budget: vk::DeviceSize,
    pub usage: vk::DeviceSize,
    /// Bytes allocated through the simulator from this heap.
    pub allocated: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// Returned when an allocation would go over the simulated limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverBudget {
    pub heap: usize,
    pub limit: vk::DeviceSize,
    pub allocated: vk::DeviceSize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub heaps: Vec<HeapInfo>,
    pub types: Vec<MemoryTypeInfo>,
    /// True if the budget was refreshed since the last change to the
    /// bindings of any device using this physical device.
    pub budget_updated: bool,
    populated: bool,
}

/// Scales a value by a percentage the same way for every figure that
/// the simulator reports.
pub fn adjust_by_percent(value: u64, percent: u32) -> u64 {
    (value as f64 * (percent as f64 / 100.0)) as u64
}

impl MemoryTable {
    pub fn new() -> MemoryTable {
        MemoryTable::default()
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Copies the heaps and types from a properties query. If the
    /// budget structure was part of the query its figures are copied
    /// too, otherwise the budget and usage are reset to unknown. The
    /// allocation counters are kept.
    pub fn update(
        &mut self,
        props: &vk::PhysicalDeviceMemoryProperties,
        budget: Option<&vk::PhysicalDeviceMemoryBudgetPropertiesEXT>,
    ) {
        let heap_count = (props.memory_heap_count as usize)
            .min(vk::MAX_MEMORY_HEAPS);
        let type_count = (props.memory_type_count as usize)
            .min(vk::MAX_MEMORY_TYPES);

        self.heaps.resize(heap_count, Default::default());

        for (i, heap) in self.heaps.iter_mut().enumerate() {
            heap.size = props.memory_heaps[i].size;
            heap.flags = props.memory_heaps[i].flags;

            match budget {
                Some(budget) => {
                    heap.budget = budget.heap_budget[i];
                    heap.usage = budget.heap_usage[i];
                },
                None => {
                    heap.budget = 0;
                    heap.usage = 0;
                },
            }
        }

        self.types = props.memory_types[0..type_count]
            .iter()
            .map(|t| MemoryTypeInfo {
                property_flags: t.property_flags,
                heap_index: t.heap_index,
            })
            .collect();

        self.budget_updated = budget.is_some();
        self.populated = true;
    }

    pub fn heap_for_type(&self, memory_type_index: u32) -> Option<usize> {
        let heap = self.types.get(memory_type_index as usize)?.heap_index;

        if (heap as usize) < self.heaps.len() {
            Some(heap as usize)
        } else {
            None
        }
    }

    /// The amount of memory that the simulator lets the application
    /// allocate from a heap. The budget is used if the driver reports
    /// one, otherwise the heap size.
    pub fn limit(&self, heap: usize, percent: u32) -> vk::DeviceSize {
        let Some(info) = self.heaps.get(heap) else {
            return 0;
        };

        let real = if info.budget == 0 { info.size } else { info.budget };

        adjust_by_percent(real, percent)
    }

    /// Checks whether `size` more bytes fit in the heap of the memory
    /// type. On success the heap index is returned. Unknown memory
    /// types are not limited.
    pub fn admit(
        &self,
        memory_type_index: u32,
        size: vk::DeviceSize,
        percent: u32,
    ) -> Result<Option<usize>, OverBudget> {
        let Some(heap) = self.heap_for_type(memory_type_index) else {
            return Ok(None);
        };

        let allocated = self.heaps[heap].allocated;
        let limit = self.limit(heap, percent);

        if allocated.saturating_add(size) > limit {
            Err(OverBudget { heap, limit, allocated })
        } else {
            Ok(Some(heap))
        }
    }

    pub fn record_allocation(&mut self, heap: usize, size: vk::DeviceSize) {
        if let Some(info) = self.heaps.get_mut(heap) {
            info.allocated = info.allocated.saturating_add(size);
        }
    }

    pub fn record_free(&mut self, heap: usize, size: vk::DeviceSize) {
        if let Some(info) = self.heaps.get_mut(heap) {
            info.allocated = info.allocated.saturating_sub(size);
        }
    }
}

/// Shrinks the heaps reported to the application. The budget figures
/// are shrunk in the same way so that they stay consistent with the
/// heap sizes.
pub fn scale_memory_properties(
    props: &mut vk::PhysicalDeviceMemoryProperties,
    budget: Option<&mut vk::PhysicalDeviceMemoryBudgetPropertiesEXT>,
    percent: u32,
) {
    let heap_count = (props.memory_heap_count as usize)
        .min(vk::MAX_MEMORY_HEAPS);

    for heap in props.memory_heaps[0..heap_count].iter_mut() {
        heap.size = adjust_by_percent(heap.size, percent);
    }

    if let Some(budget) = budget {
        for heap_budget in budget.heap_budget[0..heap_count].iter_mut() {
            *heap_budget = adjust_by_percent(*heap_budget, percent);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn one_heap(size: vk::DeviceSize) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 1,
            ..Default::default()
        };

        props.memory_heaps[0] = vk::MemoryHeap {
            size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            heap_index: 0,
        };

        props
    }

    #[test]
    fn percent() {
        assert_eq!(adjust_by_percent(1000, 50), 500);
        assert_eq!(adjust_by_percent(1000, 100), 1000);
        assert_eq!(adjust_by_percent(999, 1), 9);
        assert_eq!(adjust_by_percent(0, 75), 0);
    }

    #[test]
    fn admission() {
        let mut table = MemoryTable::new();
        table.update(&one_heap(1000), None);

        assert_eq!(table.limit(0, 50), 500);

        let heap = table.admit(0, 400, 50).unwrap().unwrap();
        table.record_allocation(heap, 400);

        // 400 + 200 is over the 500 that is reported
        assert_eq!(
            table.admit(1, 200, 50),
            Err(OverBudget { heap: 0, limit: 500, allocated: 400 }),
        );

        table.record_free(heap, 400);
        assert_eq!(table.admit(1, 200, 50), Ok(Some(0)));
    }

    #[test]
    fn budget_is_the_limit() {
        let mut table = MemoryTable::new();
        let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        budget.heap_budget[0] = 600;
        budget.heap_usage[0] = 100;

        table.update(&one_heap(1000), Some(&budget));

        assert!(table.budget_updated);
        assert_eq!(table.heaps[0].usage, 100);
        assert_eq!(table.limit(0, 50), 300);

        // A query without the budget forgets it
        table.update(&one_heap(1000), None);
        assert!(!table.budget_updated);
        assert_eq!(table.heaps[0].budget, 0);
        assert_eq!(table.limit(0, 50), 500);
    }

    #[test]
    fn refresh_keeps_allocations() {
        let mut table = MemoryTable::new();
        assert!(!table.is_populated());

        table.update(&one_heap(1000), None);
        table.record_allocation(0, 300);
        table.update(&one_heap(2000), None);

        assert!(table.is_populated());
        assert_eq!(table.heaps[0].size, 2000);
        assert_eq!(table.heaps[0].allocated, 300);
    }

    #[test]
    fn unknown_type() {
        let mut table = MemoryTable::new();
        table.update(&one_heap(1000), None);

        assert_eq!(table.heap_for_type(5), None);
        assert_eq!(table.admit(5, 1 << 40, 10), Ok(None));
    }

    #[test]
    fn scaling() {
        let mut props = one_heap(1000);
        let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        budget.heap_budget[0] = 800;
        budget.heap_usage[0] = 100;

        scale_memory_properties(&mut props, Some(&mut budget), 25);

        assert_eq!(props.memory_heaps[0].size, 250);
        assert_eq!(budget.heap_budget[0], 200);
        // Usage is real and isn’t scaled
        assert_eq!(budget.heap_usage[0], 100);
        // Heaps past the count are left alone
        assert_eq!(props.memory_heaps[1].size, 0);
    }
}
