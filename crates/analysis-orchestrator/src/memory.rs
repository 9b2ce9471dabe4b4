/// Reports current process memory use.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> Option<u64>;
}

/// Resident set size from the `VmRSS` line of `/proc/self/status`.
/// Returns `None` where procfs is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_bytes(&status)
    }
}

/// `VmRSS` is reported in kB regardless of the kernel page size.
fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some(unit) if unit.eq_ignore_ascii_case("kb") => Some(value * 1024),
        _ => None,
    }
}
