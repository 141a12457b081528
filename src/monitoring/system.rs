use super::performance::ProcessStatsSnapshot;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Static description of the machine running the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub os: String,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub virtualization_system: String,
    pub virtualization_role: String,
    pub cores: usize,
    pub vendor_id: String,
    pub family: String,
    pub model: String,
    pub stepping: i32,
    pub model_name: String,
    pub mhz: f64,
    pub cache_size: i32,
    pub flags: Vec<String>,
    pub timestamp: i64,
}

/// Source of host and per-process resource information.
pub trait ProcessSampler: Send {
    fn host_info(&mut self) -> Result<HostInfo>;

    /// `root` followed by its live descendants, or `None` once `root` has exited.
    fn live_tree(&mut self, root: u32) -> Result<Option<Vec<u32>>>;

    fn sample(&mut self, pid: u32) -> Result<ProcessStatsSnapshot>;
}

pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for SysinfoSampler {
    fn host_info(&mut self) -> Result<HostInfo> {
        self.system.refresh_cpu_all();
        let cpus = self.system.cpus();
        let first = cpus
            .first()
            .ok_or_else(|| Error::Monitoring("no CPU information available".to_string()))?;

        let platform = System::distribution_id();
        let mut info = HostInfo {
            os: std::env::consts::OS.to_string(),
            platform_family: platform_family(&platform).to_string(),
            platform,
            platform_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            cores: cpus.len(),
            vendor_id: first.vendor_id().to_string(),
            model_name: first.brand().to_string(),
            mhz: first.frequency() as f64,
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        #[cfg(target_os = "linux")]
        {
            if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
                apply_cpuinfo(&mut info, &cpuinfo);
            }
            let product = std::fs::read_to_string("/sys/class/dmi/id/product_name").unwrap_or_default();
            let (system, role) = virtualization(&info.flags, &product);
            info.virtualization_system = system;
            info.virtualization_role = role;
        }

        Ok(info)
    }

    fn live_tree(&mut self, root: u32) -> Result<Option<Vec<u32>>> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

        let alive = |p: &sysinfo::Process| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead);

        match self.system.process(Pid::from_u32(root)) {
            Some(process) if alive(process) => {}
            _ => return Ok(None),
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if !alive(process) {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }

        let mut tree = descendants(root, &children);
        #[cfg(target_os = "linux")]
        tree.retain(|pid| *pid == root || !procfs::is_thread(*pid));

        Ok(Some(tree))
    }

    fn sample(&mut self, pid: u32) -> Result<ProcessStatsSnapshot> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory().with_disk_usage(),
        );

        let process = self
            .system
            .process(sys_pid)
            .ok_or_else(|| Error::Monitoring(format!("Could not find process with pid {pid}")))?;

        let disk = process.disk_usage();
        let mut snapshot = ProcessStatsSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            rss: process.memory(),
            vms: process.virtual_memory(),
            read_bytes: disk.total_read_bytes,
            write_bytes: disk.total_written_bytes,
            ..Default::default()
        };

        #[cfg(target_os = "linux")]
        {
            procfs::apply(pid, &mut snapshot)
                .map_err(|e| Error::Monitoring(format!("process {pid}: {e}")))?;
        }

        debug!("Sampled process {}: {:?}", pid, snapshot);
        Ok(snapshot)
    }
}

/// Breadth-first walk of the parent → children map starting at `root`.
fn descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut tree = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !tree.contains(&kid) {
                    tree.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }

    tree
}

fn platform_family(platform: &str) -> &'static str {
    match platform {
        "debian" | "ubuntu" | "linuxmint" | "raspbian" | "pop" => "debian",
        "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" | "amzn" => "rhel",
        "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => "suse",
        "arch" | "manjaro" | "endeavouros" => "arch",
        "alpine" => "alpine",
        "gentoo" => "gentoo",
        _ => "",
    }
}

/// Fills CPU details from the first processor block of `/proc/cpuinfo`.
fn apply_cpuinfo(info: &mut HostInfo, cpuinfo: &str) {
    let mut processors = 0;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        if key == "processor" {
            processors += 1;
            continue;
        }
        if processors > 1 {
            continue;
        }

        match key {
            "vendor_id" => info.vendor_id = value.to_string(),
            "cpu family" => info.family = value.to_string(),
            "model" => info.model = value.to_string(),
            "model name" => info.model_name = value.to_string(),
            "stepping" => info.stepping = value.parse().unwrap_or_default(),
            "cpu MHz" => info.mhz = value.parse().unwrap_or(info.mhz),
            "cache size" => {
                info.cache_size = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default()
            }
            "flags" => info.flags = value.split_whitespace().map(str::to_string).collect(),
            _ => {}
        }
    }

    if processors > 0 {
        info.cores = processors;
    }
}

/// Virtualization system and role derived from CPU flags and the DMI product name.
fn virtualization(flags: &[String], product_name: &str) -> (String, String) {
    let product = product_name.trim().to_lowercase();
    let system = ["kvm", "qemu", "virtualbox", "vmware", "xen", "hyper-v", "bochs"]
        .iter()
        .find(|name| product.contains(*name))
        .map(|name| name.to_string())
        .unwrap_or_default();

    let role = if flags.iter().any(|f| f == "hypervisor") || !system.is_empty() {
        "guest"
    } else {
        "host"
    };

    (system, role.to_string())
}

#[cfg(target_os = "linux")]
mod procfs {
    use super::ProcessStatsSnapshot;
    use std::fs;
    use std::io;

    fn clock_ticks_per_second() -> f64 {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks <= 0 {
            100.0
        } else {
            ticks as f64
        }
    }

    pub(super) fn apply(pid: u32, snapshot: &mut ProcessStatsSnapshot) -> io::Result<()> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
        let (utime, stime, iowait) = parse_stat(&stat)?;
        let hz = clock_ticks_per_second();
        snapshot.utime = utime as f64 / hz;
        snapshot.stime = stime as f64 / hz;
        snapshot.iowait = iowait as f64 / hz;

        if let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) {
            snapshot.swap = parse_swap(&status);
        }

        // Requires the same uid or CAP_SYS_PTRACE; counters stay zero otherwise.
        if let Ok(io_counters) = fs::read_to_string(format!("/proc/{pid}/io")) {
            apply_io(&io_counters, snapshot);
        }

        Ok(())
    }

    /// utime, stime and delayacct_blkio_ticks, in clock ticks.
    pub(super) fn parse_stat(contents: &str) -> io::Result<(u64, u64, u64)> {
        let close_paren = contents.rfind(')').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Invalid /proc/[pid]/stat format")
        })?;
        let fields: Vec<&str> = contents
            .get(close_paren + 1..)
            .unwrap_or_default()
            .split_whitespace()
            .collect();

        let field = |idx: usize| -> u64 {
            fields
                .get(idx)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        Ok((field(11), field(12), field(39)))
    }

    /// Thread entries share their process's Tgid.
    pub(super) fn is_thread(pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{pid}/status"))
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|line| line.strip_prefix("Tgid:"))
                    .and_then(|v| v.trim().parse::<u32>().ok())
            })
            .is_some_and(|tgid| tgid != pid)
    }

    pub(super) fn parse_swap(status: &str) -> u64 {
        status
            .lines()
            .find_map(|line| line.strip_prefix("VmSwap:"))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    }

    pub(super) fn apply_io(contents: &str, snapshot: &mut ProcessStatsSnapshot) {
        for line in contents.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "syscr" => snapshot.read_count = value,
                "syscw" => snapshot.write_count = value,
                "read_bytes" => snapshot.read_bytes = value,
                "write_bytes" => snapshot.write_bytes = value,
                _ => {}
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_stat_handles_spaces_in_comm() {
            let stat = "1234 (my exec) S 1 1234 1234 0 -1 4194304 100 0 0 0 250 75 0 0 20 0 1 0 100 1000 10 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 42 0 0";
            let (utime, stime, iowait) = parse_stat(stat).unwrap();
            assert_eq!(utime, 250);
            assert_eq!(stime, 75);
            assert_eq!(iowait, 42);
        }

        #[test]
        fn test_parse_stat_rejects_garbage() {
            assert!(parse_stat("garbage").is_err());
        }

        #[test]
        fn test_parse_swap() {
            let status = "Name:\tsh\nVmRSS:\t  1000 kB\nVmSwap:\t     12 kB\n";
            assert_eq!(parse_swap(status), 12 * 1024);
            assert_eq!(parse_swap("Name:\tsh\n"), 0);
        }

        #[test]
        fn test_apply_io() {
            let io = "rchar: 10\nwchar: 20\nsyscr: 3\nsyscw: 4\nread_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
            let mut snapshot = ProcessStatsSnapshot::default();
            apply_io(io, &mut snapshot);
            assert_eq!(snapshot.read_count, 3);
            assert_eq!(snapshot.write_count, 4);
            assert_eq!(snapshot.read_bytes, 4096);
            assert_eq!(snapshot.write_bytes, 8192);
        }

        #[test]
        fn test_sample_own_process() {
            let mut snapshot = ProcessStatsSnapshot::default();
            apply(std::process::id(), &mut snapshot).unwrap();
            assert!(snapshot.utime >= 0.0);
        }
    }
}
