use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Samples resident memory of the current process for training metrics.
pub struct ResourceSampler {
    sys: System,
    pid: Option<sysinfo::Pid>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::debug!(error = %e, "Current pid unavailable"))
            .ok();

        Self {
            sys: System::new(),
            pid,
        }
    }

    /// Resident memory of this process in GB, or `None` if it can't be read.
    pub fn process_memory_gb(&mut self) -> Option<f64> {
        let pid = self.pid?;
        self.sys.refresh_all();
        self.sys
            .process(pid)
            .map(|process| process.memory() as f64 / BYTES_PER_GB)
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_non_negative() {
        let mut sampler = ResourceSampler::new();
        if let Some(gb) = sampler.process_memory_gb() {
            assert!(gb >= 0.0);
        }
    }
}
