use serde::{Deserialize, Serialize};

use super::probe::{HardwareProbe, SysinfoProbe};

/// Label used when the chip description matches nothing in the table.
pub const FALLBACK_DEVICE_TYPE: &str = "Apple Silicon";

/// Compute throughput assumed for unrecognized devices.
pub const DEFAULT_TFLOPS: f64 = 14.2;

/// Memory bandwidth assumed for unrecognized devices.
pub const DEFAULT_BANDWIDTH_GBPS: f64 = 100.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Static capability entry for a known chip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipSpec {
    pub label: &'static str,
    pub family: &'static str,
    pub variant: Option<&'static str>,
    pub tflops: f64,
    pub bandwidth_gbps: f64,
}

const fn chip(
    label: &'static str,
    family: &'static str,
    variant: Option<&'static str>,
    tflops: f64,
    bandwidth_gbps: f64,
) -> ChipSpec {
    ChipSpec {
        label,
        family,
        variant,
        tflops,
        bandwidth_gbps,
    }
}

/// Known chips, newest family first.
pub const CHIP_TABLE: &[ChipSpec] = &[
    chip("M4 Max", "M4", Some("Max"), 40.0, 546.0),
    chip("M4 Pro", "M4", Some("Pro"), 19.0, 273.0),
    chip("M4", "M4", None, 11.0, 120.0),
    chip("M3 Max", "M3", Some("Max"), 40.0, 400.0),
    chip("M3 Pro", "M3", Some("Pro"), 20.0, 200.0),
    chip("M3", "M3", None, 16.5, 100.0),
    chip("M2 Ultra", "M2", Some("Ultra"), 46.0, 800.0),
    chip("M2 Max", "M2", Some("Max"), 23.0, 400.0),
    chip("M2 Pro", "M2", Some("Pro"), 19.0, 200.0),
    chip("M2", "M2", None, 15.8, 100.0),
    chip("M1 Ultra", "M1", Some("Ultra"), 32.0, 800.0),
    chip("M1 Max", "M1", Some("Max"), 16.0, 400.0),
    chip("M1 Pro", "M1", Some("Pro"), 11.0, 200.0),
    chip("M1", "M1", None, 11.0, 68.25),
];

/// Local device capability, derived once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// Device-type label from [`CHIP_TABLE`] or [`FALLBACK_DEVICE_TYPE`]
    pub device_type: String,

    /// Total memory in GB, rounded to one decimal
    pub total_memory_gb: f64,

    /// Estimated compute throughput (TFLOPS)
    pub total_tflops: f64,

    /// Estimated memory bandwidth (GB/s)
    pub memory_bandwidth_gbps: f64,
}

impl HardwareProfile {
    /// Profile used when nothing about the hardware could be determined.
    pub fn fallback() -> Self {
        Self {
            device_type: FALLBACK_DEVICE_TYPE.to_string(),
            total_memory_gb: 0.0,
            total_tflops: DEFAULT_TFLOPS,
            memory_bandwidth_gbps: DEFAULT_BANDWIDTH_GBPS,
        }
    }

    /// Detect the local hardware profile using `sysinfo`.
    ///
    /// Never fails: any query that errors degrades to the fallback value for
    /// that field and logs a warning.
    ///
    /// # Example
    ///
    /// ```
    /// use trainer::HardwareProfile;
    ///
    /// let profile = HardwareProfile::detect();
    /// println!("{} with {} GB", profile.device_type, profile.total_memory_gb);
    /// assert!(profile.total_tflops > 0.0);
    /// ```
    pub fn detect() -> Self {
        Self::detect_with(&SysinfoProbe::new())
    }

    /// Detect the profile from an arbitrary hardware probe.
    ///
    /// Deterministic for a given probe.
    pub fn detect_with<P: HardwareProbe + ?Sized>(probe: &P) -> Self {
        let device_type = match probe.chip_description() {
            Ok(description) => classify_device(&description),
            Err(e) => {
                tracing::warn!(error = %e, "Chip query failed, using fallback device type");
                FALLBACK_DEVICE_TYPE.to_string()
            }
        };

        let total_memory_gb = Self::detect_memory_gb(probe);
        let (total_tflops, memory_bandwidth_gbps) = lookup_capability(&device_type);

        let profile = Self {
            device_type,
            total_memory_gb,
            total_tflops,
            memory_bandwidth_gbps,
        };

        tracing::debug!(
            device_type = %profile.device_type,
            memory_gb = profile.total_memory_gb,
            tflops = profile.total_tflops,
            "Hardware profile detected"
        );

        profile
    }

    /// Device-reported memory first, OS total memory second.
    fn detect_memory_gb<P: HardwareProbe + ?Sized>(probe: &P) -> f64 {
        match probe.device_memory_bytes() {
            Ok(Some(bytes)) if bytes > 0 => return round_to_tenth(bytes as f64 / BYTES_PER_GB),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Device memory counter unavailable");
            }
        }

        match probe.system_memory_bytes() {
            Ok(bytes) => round_to_tenth(bytes as f64 / BYTES_PER_GB),
            Err(e) => {
                tracing::warn!(error = %e, "System memory query failed, reporting 0 GB");
                0.0
            }
        }
    }
}

/// Map a free-form chip description onto a known device-type label.
///
/// Matching is token based ("Apple M2 Max" -> "M2 Max"); a family with an
/// unknown variant resolves to the base family entry.
pub fn classify_device(description: &str) -> String {
    let tokens: Vec<&str> = description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let has = |word: &str| tokens.iter().any(|t| t.eq_ignore_ascii_case(word));

    CHIP_TABLE
        .iter()
        .filter(|spec| has(spec.family))
        .find(|spec| spec.variant.map_or(true, has))
        .map(|spec| spec.label.to_string())
        .unwrap_or_else(|| FALLBACK_DEVICE_TYPE.to_string())
}

/// Throughput and bandwidth for a device-type label.
pub fn lookup_capability(device_type: &str) -> (f64, f64) {
    CHIP_TABLE
        .iter()
        .find(|spec| spec.label == device_type)
        .map(|spec| (spec.tflops, spec.bandwidth_gbps))
        .unwrap_or((DEFAULT_TFLOPS, DEFAULT_BANDWIDTH_GBPS))
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
