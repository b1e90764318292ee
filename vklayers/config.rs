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

//! Settings for the slow device simulator. The values are fetched
//! once when an instance is created through a [SettingsProvider].

use std::env;
use std::fmt;

pub const FENCE_DELAY_TYPE_KEY: &str = "fence_delay_type";
pub const FENCE_DELAY_COUNT_KEY: &str = "fence_delay_count";
pub const MEMORY_PERCENT_KEY: &str = "memory_percent";

/// How the simulated fence delay is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceDelayType {
    /// Fences are passed straight through.
    #[default]
    None,
    /// The delay is a number of milliseconds counted from the moment
    /// the fence was signalled.
    MsFromTrigger,
    /// The delay is a number of milliseconds counted from the first
    /// time the application queries or waits on the fence.
    MsFromFirstQuery,
    /// The delay is a number of status queries or waits that will
    /// fail before the real state of the fence is reported.
    NumFailWaits,
}

impl FenceDelayType {
    /// Parses a setting value. The comparison is case-insensitive
    /// and unknown values leave the delay disabled.
    pub fn from_setting(value: &str) -> FenceDelayType {
        match value.trim().to_ascii_lowercase().as_str() {
            "ms_from_trigger" => FenceDelayType::MsFromTrigger,
            "ms_from_first_query" => FenceDelayType::MsFromFirstQuery,
            "num_fail_waits" => FenceDelayType::NumFailWaits,
            _ => FenceDelayType::None,
        }
    }
}

impl fmt::Display for FenceDelayType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FenceDelayType::None => "none",
            FenceDelayType::MsFromTrigger => "ms_from_trigger",
            FenceDelayType::MsFromFirstQuery => "ms_from_first_query",
            FenceDelayType::NumFailWaits => "num_fail_waits",
        };

        f.write_str(name)
    }
}

/// Source of the layer settings. The production implementation reads
/// the environment but tests can provide their own.
pub trait SettingsProvider {
    /// Returns the raw value for `key`, or `None` if it isn’t set.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads settings from environment variables. For a key like
/// `memory_percent` the variable `<PREFIX>_MEMORY_PERCENT` is checked
/// for each prefix in turn.
#[derive(Debug, Clone)]
pub struct EnvSettingsProvider {
    prefixes: &'static [&'static str],
}

impl EnvSettingsProvider {
    pub const fn new(prefixes: &'static [&'static str]) -> EnvSettingsProvider {
        EnvSettingsProvider { prefixes }
    }

    /// The provider used by the slow device simulator. The layer
    /// namespace takes priority over the short compatibility one.
    pub const fn slow_device_simulator() -> EnvSettingsProvider {
        EnvSettingsProvider::new(&[
            "VK_LUNARG_SLOW_DEVICE_SIMULATOR",
            "SLOWDEVICESIM",
        ])
    }
}

impl SettingsProvider for EnvSettingsProvider {
    fn get(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_uppercase();

        self.prefixes
            .iter()
            .find_map(|prefix| env::var(format!("{}_{}", prefix, key)).ok())
    }
}

#[cfg(test)]
impl<const N: usize> SettingsProvider for [(&str, &str); N] {
    fn get(&self, key: &str) -> Option<String> {
        self.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    }
}

/// The simulator configuration that is copied into every instance,
/// physical device and device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorConfig {
    pub fence_delay_type: FenceDelayType,
    /// Milliseconds or a number of failed waits depending on
    /// `fence_delay_type`.
    pub fence_delay_count: u64,
    /// Percentage of the real memory that is reported. Always in the
    /// range [1, 100].
    pub memory_percent: u32,
}

impl Default for SimulatorConfig {
    fn default() -> SimulatorConfig {
        SimulatorConfig {
            fence_delay_type: FenceDelayType::None,
            fence_delay_count: 0,
            memory_percent: 100,
        }
    }
}

impl SimulatorConfig {
    pub fn from_provider<P: SettingsProvider + ?Sized>(
        provider: &P
    ) -> SimulatorConfig {
        let mut config = SimulatorConfig::default();

        if let Some(value) = provider.get(FENCE_DELAY_TYPE_KEY) {
            config.fence_delay_type = FenceDelayType::from_setting(&value);
        }

        if let Some(value) = provider.get(FENCE_DELAY_COUNT_KEY) {
            match value.trim().parse::<i64>() {
                Ok(count) => config.fence_delay_count = count.max(0) as u64,
                Err(_) => log::warn!(
                    "Ignoring invalid {} setting “{}”",
                    FENCE_DELAY_COUNT_KEY,
                    value,
                ),
            }
        }

        if let Some(value) = provider.get(MEMORY_PERCENT_KEY) {
            match value.trim().parse::<i64>() {
                Ok(percent) => {
                    config.memory_percent = percent.clamp(1, 100) as u32;
                },
                Err(_) => log::warn!(
                    "Ignoring invalid {} setting “{}”",
                    MEMORY_PERCENT_KEY,
                    value,
                ),
            }
        }

        config
    }

    /// The simulator only changes behaviour when at least one setting
    /// differs from its default.
    pub fn layer_enabled(&self) -> bool {
        self.fence_delay_type != FenceDelayType::None
            || self.memory_percent != 100
    }
}
