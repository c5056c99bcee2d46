use std::fmt;

/// Env var overriding the detected CPU limit ("4" or "4000m").
pub const CPU_LIMIT_ENV: &str = "FAILOVER_CPU_LIMIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLimitSource {
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl fmt::Display for CpuLimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuLimitSource::Env => write!(f, "{}", CPU_LIMIT_ENV),
            CpuLimitSource::CgroupV2 => write!(f, "cgroup v2"),
            CpuLimitSource::CgroupV1 => write!(f, "cgroup v1"),
            CpuLimitSource::Host => write!(f, "system CPU count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLimit {
    pub threads: usize,
    pub source: CpuLimitSource,
}

/// Container-aware worker thread count for the tokio runtime.
///
/// Detection order:
/// 1. `FAILOVER_CPU_LIMIT`
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1: `/sys/fs/cgroup/cpu/cpu.cfs_quota_us` + `cpu.cfs_period_us`
/// 4. `std::thread::available_parallelism()`
///
/// Fractional limits round up, so a 500m container still gets one worker.
pub fn get_container_cpu_limit() -> CpuLimit {
    let env = std::env::var(CPU_LIMIT_ENV).ok();
    let v2 = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok();
    let v1 = match (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        (Ok(quota), Ok(period)) => Some((quota, period)),
        _ => None,
    };
    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);

    resolve_cpu_limit(
        env.as_deref(),
        v2.as_deref(),
        v1.as_ref().map(|(q, p)| (q.as_str(), p.as_str())),
        host,
    )
}

fn resolve_cpu_limit(
    env: Option<&str>,
    cgroup_v2: Option<&str>,
    cgroup_v1: Option<(&str, &str)>,
    host: usize,
) -> CpuLimit {
    let detected = env
        .and_then(parse_cpu_value)
        .map(|n| (n, CpuLimitSource::Env))
        .or_else(|| {
            cgroup_v2
                .and_then(parse_cgroup_v2_cpu)
                .map(|n| (n, CpuLimitSource::CgroupV2))
        })
        .or_else(|| {
            cgroup_v1
                .and_then(|(quota, period)| parse_cgroup_v1_cpu(quota, period))
                .map(|n| (n, CpuLimitSource::CgroupV1))
        });

    match detected {
        Some((threads, source)) => CpuLimit {
            threads: threads.max(1),
            source,
        },
        None => CpuLimit {
            threads: host.max(1),
            source: CpuLimitSource::Host,
        },
    }
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(stripped) = value.strip_suffix('m') {
        stripped.parse::<usize>().ok().map(|m| m.div_ceil(1000))
    } else {
        value.parse::<usize>().ok()
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    quota_to_cores(quota.parse().ok()?, period.parse().ok()?)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    quota_to_cores(quota.trim().parse().ok()?, period.trim().parse().ok()?)
}

fn quota_to_cores(quota: i64, period: i64) -> Option<usize> {
    if quota > 0 && period > 0 {
        Some((quota as u64).div_ceil(period as u64) as usize)
    } else {
        None
    }
}
