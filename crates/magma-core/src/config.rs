//! # In-Order Configuration
//!
//! Explicit, immutable configuration of the in-order execution machinery.
//!
//! Every toggle that shapes emitted command streams lives here and is passed
//! once at device construction. Nothing is read from the environment.

use crate::types::ByteSize;

// =============================================================================
// SYNCHRONIZED DISPATCH MODE
// =============================================================================

/// Cross-queue synchronized dispatch mode of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDispatchMode {
    /// No token handling
    #[default]
    Disabled,
    /// Wait until no queue owns the token, never acquire it
    Limited,
    /// Acquire the token before the payload and release it afterwards
    Full,
}

// =============================================================================
// IN-ORDER CONFIGURATION
// =============================================================================

/// Configuration of the in-order execution core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InOrderConfig {
    /// Allow promotion of regular events to counter-based mode
    pub implicit_counter_based_events: bool,
    /// Multi-tile lists signal with a single atomic increment
    pub atomic_signalling: bool,
    /// Mirror every counter write into a host-visible region
    pub duplicated_host_storage: bool,
    /// Record patch sites on replayable lists
    pub regular_list_patching: bool,
    /// Allow relaxed ordering when the submission layer supports it
    pub relaxed_ordering: bool,
    /// Minimum registered producing clients before relaxed ordering kicks in
    pub relaxed_ordering_min_clients: u32,
    /// Host synchronization delegates to the wait-on-address primitive
    pub wait_on_user_fence: bool,
    /// Override the device's 64-bit counter support
    pub force_wide_counter: Option<bool>,
    /// Page size of counter tag pools
    pub counter_page_size: ByteSize,
    /// Upper bound of the spin backoff between host polls
    pub host_sync_max_backoff_spins: u32,
}

impl InOrderConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            implicit_counter_based_events: true,
            atomic_signalling: false,
            duplicated_host_storage: false,
            regular_list_patching: true,
            relaxed_ordering: true,
            relaxed_ordering_min_clients: 2,
            wait_on_user_fence: false,
            force_wide_counter: None,
            counter_page_size: ByteSize::KIB_64,
            host_sync_max_backoff_spins: 1024,
        }
    }

    /// Set atomic device signalling
    pub const fn with_atomic_signalling(mut self, enabled: bool) -> Self {
        self.atomic_signalling = enabled;
        self
    }

    /// Set duplicated host storage
    pub const fn with_duplicated_host_storage(mut self, enabled: bool) -> Self {
        self.duplicated_host_storage = enabled;
        self
    }

    /// Set implicit counter-based event promotion
    pub const fn with_implicit_counter_based_events(mut self, enabled: bool) -> Self {
        self.implicit_counter_based_events = enabled;
        self
    }

    /// Set patching of replayable lists
    pub const fn with_regular_list_patching(mut self, enabled: bool) -> Self {
        self.regular_list_patching = enabled;
        self
    }

    /// Set relaxed ordering
    pub const fn with_relaxed_ordering(mut self, enabled: bool) -> Self {
        self.relaxed_ordering = enabled;
        self
    }

    /// Set host waits through the wait-on-address primitive
    pub const fn with_wait_on_user_fence(mut self, enabled: bool) -> Self {
        self.wait_on_user_fence = enabled;
        self
    }

    /// Force 32-bit (`false`) or 64-bit (`true`) counters
    pub const fn with_wide_counter(mut self, wide: bool) -> Self {
        self.force_wide_counter = Some(wide);
        self
    }

    /// Resolve counter width against the device capability
    #[inline]
    pub const fn use_wide_counter(&self, device_supports_wide: bool) -> bool {
        match self.force_wide_counter {
            Some(wide) => wide,
            None => device_supports_wide,
        }
    }
}

impl Default for InOrderConfig {
    fn default() -> Self {
        Self::new()
    }
}
