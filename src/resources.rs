//! Process resource sampling
//!
//! Used for the `memory_mb` request metadata field.

/// Peak resident set size of this process in megabytes
///
/// Returns `None` when the platform does not expose it.
#[allow(clippy::unnecessary_cast)] // ru_maxrss is c_long, width differs per platform
pub fn peak_memory_mb() -> Option<f64> {
    #[cfg(unix)]
    {
        unsafe {
            let mut usage = std::mem::zeroed::<libc::rusage>();
            if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
                let max_rss = usage.ru_maxrss as f64;

                // Linux reports kilobytes, macOS reports bytes
                #[cfg(target_os = "macos")]
                let bytes = max_rss;
                #[cfg(not(target_os = "macos"))]
                let bytes = max_rss * 1024.0;

                return Some(crate::record::round2(bytes / 1024.0 / 1024.0));
            }
            tracing::debug!("getrusage failed, memory metadata unavailable");
        }
    }

    None
}
