//! Memory usage probe used by the cleanup scheduler.

use parking_lot::Mutex;
use sysinfo::System;

/// Reports memory usage as a percentage (`0.0..=100.0`).
pub trait MemoryProbe: Send + Sync + 'static {
    fn usage_percent(&self) -> f64;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> f64 + Send + Sync + 'static,
{
    fn usage_percent(&self) -> f64 {
        self()
    }
}

/// System-wide used/total memory via `sysinfo`.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn usage_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_usage_is_a_percentage() {
        let usage = SystemMemory::new().usage_percent();
        assert!((0.0..=100.0).contains(&usage));
    }

    #[test]
    fn closures_are_probes() {
        let probe = || 42.0;
        assert_eq!(probe.usage_percent(), 42.0);
    }
}
