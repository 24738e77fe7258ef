//! Configuration resolution for the Kubernetes MCP server.
//!
//! This module handles configuration values with a two-tier priority system:
//!
//! 1. **Environment Variable** - Value from environment variable
//! 2. **Default** - Built-in default value
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `K8S_PROBE_TIMEOUT` | 10s | Connectivity probe timeout in seconds |
//! | `K8S_PROBE_RETRIES` | 2 | Maximum probe retry attempts |
//! | `K8S_PROBE_RETRY_DELAY_MS` | 500ms | Initial probe retry delay |
//! | `K8S_TUNNEL_READY_TIMEOUT` | 30s | Tunnel readiness wait in seconds |

use std::env;
use std::time::Duration;

/// Default connectivity probe timeout in seconds
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Default maximum probe retry attempts for transient failures
pub(crate) const DEFAULT_PROBE_RETRIES: u32 = 2;

/// Default initial probe retry delay in milliseconds
pub(crate) const DEFAULT_PROBE_RETRY_DELAY_MS: u64 = 500;

/// Maximum probe retry delay cap
pub(crate) const MAX_PROBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default time to wait for a forwarding task to signal readiness, in seconds
pub(crate) const DEFAULT_TUNNEL_READY_TIMEOUT_SECS: u64 = 30;

/// Environment variable name for the probe timeout
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "K8S_PROBE_TIMEOUT";

/// Environment variable name for probe retry attempts
pub(crate) const PROBE_RETRIES_ENV_VAR: &str = "K8S_PROBE_RETRIES";

/// Environment variable name for the initial probe retry delay
pub(crate) const PROBE_RETRY_DELAY_MS_ENV_VAR: &str = "K8S_PROBE_RETRY_DELAY_MS";

/// Environment variable name for the tunnel readiness timeout
pub(crate) const TUNNEL_READY_TIMEOUT_ENV_VAR: &str = "K8S_TUNNEL_READY_TIMEOUT";

/// Resolve the connectivity probe timeout with priority: env var -> default
pub(crate) fn resolve_probe_timeout() -> Duration {
    if let Ok(env_timeout) = env::var(PROBE_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return Duration::from_secs(timeout);
    }

    Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)
}

/// Resolve the probe retry attempts with priority: env var -> default
pub(crate) fn resolve_probe_retries() -> u32 {
    if let Ok(env_retries) = env::var(PROBE_RETRIES_ENV_VAR)
        && let Ok(retries) = env_retries.parse::<u32>()
    {
        return retries;
    }

    DEFAULT_PROBE_RETRIES
}

/// Resolve the initial probe retry delay with priority: env var -> default
pub(crate) fn resolve_probe_retry_delay() -> Duration {
    if let Ok(env_delay) = env::var(PROBE_RETRY_DELAY_MS_ENV_VAR)
        && let Ok(delay) = env_delay.parse::<u64>()
    {
        return Duration::from_millis(delay);
    }

    Duration::from_millis(DEFAULT_PROBE_RETRY_DELAY_MS)
}

/// Resolve the tunnel readiness timeout with priority: env var -> default
pub(crate) fn resolve_tunnel_ready_timeout() -> Duration {
    if let Ok(env_timeout) = env::var(TUNNEL_READY_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return Duration::from_secs(timeout);
    }

    Duration::from_secs(DEFAULT_TUNNEL_READY_TIMEOUT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: StdMutex<()> = StdMutex::new(());

    /// Helper to set an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// Helper to remove an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod probe_timeout {
        use super::*;

        #[test]
        fn test_uses_env_var_when_set() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_TIMEOUT_ENV_VAR, "25");
            }
            let result = resolve_probe_timeout();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(25));
        }

        #[test]
        fn test_uses_default_when_unset() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_TIMEOUT_ENV_VAR);
            }
            let result = resolve_probe_timeout();
            assert_eq!(result, Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS));
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_TIMEOUT_ENV_VAR, "not_a_number");
            }
            let result = resolve_probe_timeout();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS));
        }
    }

    mod probe_retries {
        use super::*;

        #[test]
        fn test_uses_env_var_when_set() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_RETRIES_ENV_VAR, "5");
            }
            let result = resolve_probe_retries();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_RETRIES_ENV_VAR);
            }
            assert_eq!(result, 5);
        }

        #[test]
        fn test_uses_default_when_unset() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_RETRIES_ENV_VAR);
            }
            let result = resolve_probe_retries();
            assert_eq!(result, DEFAULT_PROBE_RETRIES);
        }

        #[test]
        fn test_zero_retries_is_valid() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_RETRIES_ENV_VAR, "0");
            }
            let result = resolve_probe_retries();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_RETRIES_ENV_VAR);
            }
            assert_eq!(result, 0);
        }
    }

    mod probe_retry_delay {
        use super::*;

        #[test]
        fn test_uses_env_var_when_set() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PROBE_RETRY_DELAY_MS_ENV_VAR, "1500");
            }
            let result = resolve_probe_retry_delay();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_RETRY_DELAY_MS_ENV_VAR);
            }
            assert_eq!(result, Duration::from_millis(1500));
        }

        #[test]
        fn test_uses_default_when_unset() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PROBE_RETRY_DELAY_MS_ENV_VAR);
            }
            let result = resolve_probe_retry_delay();
            assert_eq!(
                result,
                Duration::from_millis(DEFAULT_PROBE_RETRY_DELAY_MS)
            );
        }
    }

    mod tunnel_ready_timeout {
        use super::*;

        #[test]
        fn test_uses_env_var_when_set() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(TUNNEL_READY_TIMEOUT_ENV_VAR, "60");
            }
            let result = resolve_tunnel_ready_timeout();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TUNNEL_READY_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(60));
        }

        #[test]
        fn test_uses_default_when_unset() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TUNNEL_READY_TIMEOUT_ENV_VAR);
            }
            let result = resolve_tunnel_ready_timeout();
            assert_eq!(
                result,
                Duration::from_secs(DEFAULT_TUNNEL_READY_TIMEOUT_SECS)
            );
        }
    }

    mod retry_delay_cap {
        use super::*;

        #[test]
        fn test_cap_is_reasonable() {
            assert!(MAX_PROBE_RETRY_DELAY.as_secs() >= 1);
            assert!(MAX_PROBE_RETRY_DELAY.as_secs() <= 30);
        }
    }
}
