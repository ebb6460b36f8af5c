use sysinfo::System;

use crate::errors::{Result, TrainerError};

/// Source of raw hardware signals for [`HardwareProfile`](super::HardwareProfile).
///
/// Implementations report what they can; the profiler decides how to degrade.
pub trait HardwareProbe {
    /// Free-form chip description, e.g. "Apple M2 Max".
    fn chip_description(&self) -> Result<String>;

    /// Accelerator-reported memory in bytes, if the device exposes a counter.
    fn device_memory_bytes(&self) -> Result<Option<u64>>;

    /// Total OS-visible memory in bytes.
    fn system_memory_bytes(&self) -> Result<u64>;
}

/// Probe backed by the `sysinfo` crate.
///
/// On Apple Silicon the CPU brand string carries the chip name and memory is
/// unified, so there is no separate device counter to read.
pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for SysinfoProbe {
    fn chip_description(&self) -> Result<String> {
        self.sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .ok_or_else(|| TrainerError::Io(std::io::Error::other("CPU brand unavailable")))
    }

    fn device_memory_bytes(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn system_memory_bytes(&self) -> Result<u64> {
        match self.sys.total_memory() {
            0 => Err(TrainerError::Io(std::io::Error::other(
                "total memory reported as zero",
            ))),
            bytes => Ok(bytes),
        }
    }
}
