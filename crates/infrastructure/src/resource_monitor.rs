//! 本机资源采样, 用于生成心跳中的WorkerMetric

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_processors: u32,
    /// 1分钟平均负载 / 核数
    pub cpu_load: f64,
    /// 可用内存(字节)
    pub free_memory: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ResourceMonitor;

impl ResourceMonitor {
    pub fn new() -> Self {
        Self
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let cpu_processors = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let load_average = Self::load_average().unwrap_or(0.0);
        let snapshot = ResourceSnapshot {
            cpu_processors,
            cpu_load: load_average / cpu_processors as f64,
            free_memory: Self::available_memory().unwrap_or(0),
        };
        debug!("资源采样: {:?}", snapshot);
        snapshot
    }

    #[cfg(target_os = "linux")]
    fn load_average() -> Option<f64> {
        let content = std::fs::read_to_string("/proc/loadavg").ok()?;
        parse_loadavg(&content)
    }

    #[cfg(not(target_os = "linux"))]
    fn load_average() -> Option<f64> {
        None
    }

    #[cfg(target_os = "linux")]
    fn available_memory() -> Option<u64> {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo_available(&content)
    }

    #[cfg(not(target_os = "linux"))]
    fn available_memory() -> Option<u64> {
        None
    }
}

pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// 优先使用MemAvailable, 老内核退回MemFree
pub fn parse_meminfo_available(content: &str) -> Option<u64> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?;
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kb * 1024)
        })
    };
    field("MemAvailable:").or_else(|| field("MemFree:"))
}
