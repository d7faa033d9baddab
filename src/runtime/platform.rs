//! Process-wide engine platform.
//!
//! At most one [`Platform`] is alive at any time. It is built lazily by the
//! first [`PlatformHandle::acquire`] and destroyed when the last handle drops;
//! acquire and release are serialized by a single global mutex.
//!
//! V8 itself can be initialized only once per process, so the first platform
//! performs that initialization and later generations reuse it. V8 is never
//! disposed.

use crate::runtime::config::ClusterConfig;
use deno_core::v8;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Global V8 platform instance.
///
/// V8 requires exactly one platform to be initialized before creating isolates.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

static CURRENT: Lazy<Mutex<Weak<Platform>>> = Lazy::new(|| Mutex::new(Weak::new()));
static LIVE: AtomicUsize = AtomicUsize::new(0);
static GENERATION: AtomicU64 = AtomicU64::new(0);

fn initialize_v8(config: &ClusterConfig) {
    V8_PLATFORM.get_or_init(|| {
        // Set V8 flags before initialization
        if let Some(flags) = &config.v8_flags {
            v8::V8::set_flags_from_string(flags);
        }

        // Create and initialize the platform
        let platform = v8::new_default_platform(config.thread_pool_size, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();

        debug!(threads = config.thread_pool_size, "v8 initialized");
        platform
    });
}

/// Check if V8 has been initialized in this process.
pub fn is_v8_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

pub struct Platform {
    generation: u64,
}

impl Platform {
    fn new(config: &ClusterConfig) -> Self {
        initialize_v8(config);
        let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        LIVE.fetch_add(1, Ordering::SeqCst);
        debug!(generation, "platform created");
        Self { generation }
    }

    /// Monotonic id distinguishing successive platform lifetimes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of platform objects currently alive in the process.
    pub fn live_count() -> usize {
        LIVE.load(Ordering::SeqCst)
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::SeqCst);
        debug!(generation = self.generation, "platform destroyed");
    }
}

/// Shared ownership of the process-wide [`Platform`].
pub struct PlatformHandle {
    platform: Option<Arc<Platform>>,
}

impl PlatformHandle {
    pub fn acquire() -> Self {
        Self::acquire_with(&ClusterConfig::default())
    }

    /// Join the live platform, or build one from `config`. The config only
    /// affects V8 when this is the first platform in the process.
    pub fn acquire_with(config: &ClusterConfig) -> Self {
        let mut current = CURRENT.lock();
        let platform = match current.upgrade() {
            Some(platform) => platform,
            None => {
                let platform = Arc::new(Platform::new(config));
                *current = Arc::downgrade(&platform);
                platform
            }
        };
        Self {
            platform: Some(platform),
        }
    }

    pub fn generation(&self) -> u64 {
        self.platform.as_ref().map_or(0, |platform| platform.generation())
    }
}

impl Clone for PlatformHandle {
    fn clone(&self) -> Self {
        let _current = CURRENT.lock();
        Self {
            platform: self.platform.clone(),
        }
    }
}

impl Drop for PlatformHandle {
    fn drop(&mut self) {
        // Release under the global lock so a racing acquire never observes a
        // platform that is about to be destroyed.
        let _current = CURRENT.lock();
        drop(self.platform.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_initializes_v8() {
        let handle = PlatformHandle::acquire();
        assert!(is_v8_initialized());
        assert!(Platform::live_count() >= 1);
        assert!(handle.generation() >= 1);
    }

    #[test]
    fn test_handles_share_platform() {
        let first = PlatformHandle::acquire();
        let second = PlatformHandle::acquire();
        let third = first.clone();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(first.generation(), third.generation());
        assert_eq!(Platform::live_count(), 1);
    }
}
