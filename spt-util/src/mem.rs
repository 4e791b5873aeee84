/// Resident set size of the current process in megabytes, if the platform
/// exposes it. Only used as a coarse per-episode gauge.
pub fn resident_memory_mb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        // VmRSS is reported in kB regardless of the kernel's page size.
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn reports_a_positive_resident_size() {
        let mb = resident_memory_mb().expect("linux exposes VmRSS");
        assert!(mb > 0.0);
        // A test binary should not occupy anywhere near a terabyte.
        assert!(mb < 1024.0 * 1024.0);
    }
}
