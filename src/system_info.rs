use std::fs;

/// Get available system memory in GB
pub fn get_available_memory_gb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = fs::read_to_string("/proc/meminfo") {
            if let Some(gb) = parse_meminfo_available_gb(&content) {
                return gb;
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        use std::process::Command;
        if let Ok(output) = Command::new("sysctl").arg("-n").arg("hw.memsize").output() {
            if let Ok(size_str) = String::from_utf8(output.stdout) {
                if let Ok(bytes) = size_str.trim().parse::<f64>() {
                    return bytes / 1024.0 / 1024.0 / 1024.0;
                }
            }
        }
    }

    // Fallback: assume 8GB available
    8.0
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_available_gb(content: &str) -> Option<f64> {
    content
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<f64>().ok())
        .map(|kb| kb / 1024.0 / 1024.0)
}

/// Estimate image size in MB based on dimensions
pub fn estimate_image_size_mb(width: i32, height: i32, channels: i32) -> f64 {
    // Raw pixel data + overhead for OpenCV Mat structures
    let raw_size = width as f64 * height as f64 * channels as f64;
    let mb = raw_size / (1024.0 * 1024.0);
    mb * 1.5
}

/// Number of batch workers that may run at once.
///
/// Each worker holds one batch panorama plus the frame being warped, so
/// `per_batch_mb` is a rough footprint of one worker. Only half of the
/// available RAM is budgeted; the result is always in `1..=max_workers`.
pub fn worker_limit(available_gb: f64, per_batch_mb: f64, max_workers: usize) -> usize {
    let max_workers = max_workers.max(1);
    if per_batch_mb <= 0.0 {
        return max_workers;
    }
    let usable_mb = available_gb * 0.5 * 1024.0;
    let fit = (usable_mb / per_batch_mb).floor() as usize;
    fit.clamp(1, max_workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meminfo_parsing() {
        let content = "MemTotal:       16384000 kB\nMemFree:  100 kB\nMemAvailable:    8388608 kB\n";
        let gb = parse_meminfo_available_gb(content).unwrap();
        assert!((gb - 8.0).abs() < 1e-9);
        assert_eq!(parse_meminfo_available_gb("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_worker_limit_respects_memory_and_cap() {
        // 4 GB -> 2048 MB usable
        assert_eq!(worker_limit(4.0, 512.0, 8), 4);
        assert_eq!(worker_limit(64.0, 512.0, 8), 8);
        // never below one worker, even when a single batch does not fit
        assert_eq!(worker_limit(0.5, 4096.0, 8), 1);
        assert_eq!(worker_limit(4.0, 0.0, 3), 3);
        assert_eq!(worker_limit(4.0, 100.0, 0), 1);
    }

    #[test]
    fn test_image_size_estimate() {
        let mb = estimate_image_size_mb(1024, 1024, 3);
        assert!((mb - 4.5).abs() < 1e-9);
    }
}
