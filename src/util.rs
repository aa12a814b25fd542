use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms ANSI support is typically available by default.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    false
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;
    let b = bytes as f64;
    if b >= TB {
        format!("{:.2} TiB", b / TB)
    } else if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Print a one-line throughput summary for a finished run.
pub fn print_summary(total_bytes: u64, elapsed_secs: f64, files: u64, failures: u64) {
    if elapsed_secs > 0.0 {
        let mb = total_bytes as f64 / 1024.0 / 1024.0;
        println!(
            "Average speed: {:.2} MB/s ({} transferred in {:.2}s, {} files) | pending failures: {}",
            mb / elapsed_secs,
            human_bytes(total_bytes),
            elapsed_secs,
            files,
            failures
        );
    } else {
        println!("Average speed: 0.00 MB/s (0 files) | pending failures: {}", failures);
    }
}

// Simple glob-style matcher supporting '*' and '?'. Not full-featured but
// sufficient for matching repository names.
pub fn wildcard_match(pat: &str, text: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let t: Vec<char> = text.chars().collect();
    fn helper(p: &[char], t: &[char]) -> bool {
        if p.is_empty() {
            return t.is_empty();
        }
        if p[0] == '*' {
            if helper(&p[1..], t) {
                return true;
            }
            if !t.is_empty() && helper(p, &t[1..]) {
                return true;
            }
            return false;
        } else if !t.is_empty() && (p[0] == '?' || p[0] == t[0]) {
            return helper(&p[1..], &t[1..]);
        }
        false
    }
    helper(&p, &t)
}

/// Keep repositories matching any include pattern (all when none given) and
/// no exclude pattern.
pub fn select_repositories(all: &[String], include: &[String], exclude: &[String]) -> Vec<String> {
    all.iter()
        .filter(|name| include.is_empty() || include.iter().any(|p| wildcard_match(p, name)))
        .filter(|name| !exclude.iter().any(|p| wildcard_match(p, name)))
        .cloned()
        .collect()
}

// Default backoff base in milliseconds. Can be adjusted at runtime via `set_backoff_ms`.
static BACKOFF_BASE_MS: AtomicU64 = AtomicU64::new(100);

/// Set the base backoff in milliseconds used by `retry_operation` between attempts.
pub fn set_backoff_ms(ms: u64) {
    BACKOFF_BASE_MS.store(ms, Ordering::SeqCst);
}

/// Run `op` up to `max_attempts` times with linear backoff, stopping early
/// when `retriable` rejects the error.
pub fn retry_operation<F, T, E, R>(max_attempts: usize, retriable: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts || !retriable(&e) {
                    return Err(e);
                }
                let base = BACKOFF_BASE_MS.load(Ordering::SeqCst);
                let wait = base.saturating_mul(attempt as u64);
                std::thread::sleep(Duration::from_millis(wait));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn wildcard_cases() {
        assert!(wildcard_match("libs-*", "libs-release"));
        assert!(wildcard_match("npm-?", "npm-1"));
        assert!(!wildcard_match("npm-?", "npm-12"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn include_exclude_selection() {
        let all: Vec<String> =
            ["libs-release", "libs-snapshot", "npm-remote"].iter().map(|s| s.to_string()).collect();
        let picked = select_repositories(&all, &["libs-*".to_string()], &["*snapshot".to_string()]);
        assert_eq!(picked, vec!["libs-release".to_string()]);
        assert_eq!(select_repositories(&all, &[], &[]).len(), 3);
    }

    #[test]
    fn retry_stops_on_non_retriable() {
        set_backoff_ms(1);
        let calls = Cell::new(0);
        let res: Result<(), &str> = retry_operation(5, |e| *e != "fatal", || {
            calls.set(calls.get() + 1);
            Err(if calls.get() < 2 { "transient" } else { "fatal" })
        });
        assert_eq!(res, Err("fatal"));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_succeeds_after_transient() {
        set_backoff_ms(1);
        let calls = Cell::new(0);
        let res: Result<u32, &str> = retry_operation(3, |_| true, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err("again") } else { Ok(7) }
        });
        assert_eq!(res, Ok(7));
    }
}
