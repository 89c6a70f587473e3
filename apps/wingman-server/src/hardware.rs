//! Host memory probe backing `GET /api/hardware`.
//!
//! CPU numbers come from the OS; GPU numbers come from the fallback
//! heuristic only (an operator-supplied capacity, or unknown). Anything
//! deeper is the runtime's problem, not the control plane's.

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    #[serde(rename = "totalMemoryMB")]
    pub total_memory_mb: i64,
    #[serde(rename = "freeMemoryMB")]
    pub free_memory_mb: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    pub gpu: MemoryInfo,
    pub cpu: MemoryInfo,
}

const MB: u64 = 1024 * 1024;

pub fn probe() -> HardwareInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    let cpu = MemoryInfo {
        total_memory_mb: (sys.total_memory() / MB) as i64,
        free_memory_mb: (sys.available_memory() / MB) as i64,
    };
    let gpu = match std::env::var("WINGMAN_GPU_MEMORY_MB")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        Some(total) => MemoryInfo {
            total_memory_mb: total,
            free_memory_mb: total,
        },
        // unknown; -1 mirrors the "let the runtime find out" layer default
        None => MemoryInfo {
            total_memory_mb: -1,
            free_memory_mb: -1,
        },
    };
    HardwareInfo { gpu, cpu }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_cpu_memory() {
        let info = probe();
        assert!(info.cpu.total_memory_mb > 0);
        assert!(info.cpu.free_memory_mb >= 0);
        assert!(info.cpu.free_memory_mb <= info.cpu.total_memory_mb);
    }

    #[test]
    fn serialized_field_names_match_the_surface() {
        let info = probe();
        let v = serde_json::to_value(&info).unwrap();
        assert!(v["cpu"]["totalMemoryMB"].is_i64());
        assert!(v["gpu"]["freeMemoryMB"].is_i64());
    }
}
