//! Memory sampling for cache sizing and the prefetch memory guard

const MB: u64 = 1024 * 1024;
/// Budget used when the platform cannot report its memory
const FALLBACK_BUDGET_BYTES: u64 = 512 * MB;

/// A point-in-time memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySnapshot {
    /// Used fraction in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    /// Current reading, `None` when the platform cannot tell
    fn sample(&self) -> Option<MemorySnapshot>;
}

/// Reads system-wide memory from the kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn sample(&self) -> Option<MemorySnapshot> {
        system_memory()
    }
}

#[cfg(target_os = "linux")]
fn system_memory() -> Option<MemorySnapshot> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    // SAFETY: sysinfo only writes into the provided struct.
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: rc == 0 means the kernel filled the struct.
    let info = unsafe { info.assume_init() };
    let unit = info.mem_unit as u64;
    let total = (info.totalram as u64).saturating_mul(unit);
    let available = (info.freeram as u64)
        .saturating_add(info.bufferram as u64)
        .saturating_mul(unit);
    Some(MemorySnapshot {
        used_bytes: total.saturating_sub(available),
        total_bytes: total,
    })
}

#[cfg(not(target_os = "linux"))]
fn system_memory() -> Option<MemorySnapshot> {
    None
}

/// Memory budget the page cache is sized from
///
/// An explicit override wins; otherwise the total reported by the probe,
/// falling back to a fixed 512 MiB.
pub fn memory_budget(explicit: Option<u64>, probe: &dyn MemoryProbe) -> u64 {
    explicit
        .filter(|bytes| *bytes > 0)
        .or_else(|| probe.sample().map(|s| s.total_bytes).filter(|t| *t > 0))
        .unwrap_or(FALLBACK_BUDGET_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<MemorySnapshot>);

    impl MemoryProbe for Fixed {
        fn sample(&self) -> Option<MemorySnapshot> {
            self.0
        }
    }

    #[test]
    fn test_utilization() {
        let snap = MemorySnapshot {
            used_bytes: 75,
            total_bytes: 100,
        };
        assert!((snap.utilization() - 0.75).abs() < f64::EPSILON);

        let empty = MemorySnapshot {
            used_bytes: 10,
            total_bytes: 0,
        };
        assert_eq!(empty.utilization(), 0.0);
    }

    #[test]
    fn test_budget_prefers_explicit() {
        let probe = Fixed(Some(MemorySnapshot {
            used_bytes: 0,
            total_bytes: 8 * 1024 * MB,
        }));
        assert_eq!(memory_budget(Some(64 * MB), &probe), 64 * MB);
        assert_eq!(memory_budget(None, &probe), 8 * 1024 * MB);
        assert_eq!(memory_budget(None, &Fixed(None)), FALLBACK_BUDGET_BYTES);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_memory_reports_total() {
        let snap = SystemMemory.sample().expect("sysinfo available on linux");
        assert!(snap.total_bytes > 0);
        assert!(snap.used_bytes <= snap.total_bytes);
    }
}
