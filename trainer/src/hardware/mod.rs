//! Local device capability detection.
//!
//! The profile is derived once at startup from a chip lookup table; nothing in
//! here performs I/O beyond reading system counters through a [`HardwareProbe`].

mod probe;
mod profile;
mod sampler;

pub use probe::{HardwareProbe, SysinfoProbe};
pub use profile::{
    classify_device, lookup_capability, ChipSpec, HardwareProfile, CHIP_TABLE,
    DEFAULT_BANDWIDTH_GBPS, DEFAULT_TFLOPS, FALLBACK_DEVICE_TYPE,
};
pub use sampler::ResourceSampler;

/// Detect the local hardware profile.
pub fn detect_hardware() -> HardwareProfile {
    HardwareProfile::detect()
}
