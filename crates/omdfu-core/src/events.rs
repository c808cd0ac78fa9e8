//! Event system for front-end decoupling.
//!
//! The orchestrator emits progress and phase events; a CLI or test
//! station subscribes without coupling to the engine internals.

use std::fmt;

use crate::module::Component;

/// Phases of one upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    /// Clearing any interrupted previous transfer.
    AbortStale,
    /// Matching upgrade binaries in the firmware directory.
    LocateFiles,
    /// Chunked transfer of a component image.
    Transfer,
    /// Restart, commit and retimer load.
    Restart,
    /// Re-reading firmware info and restoring power state.
    Refresh,
    /// Post-upgrade slot and version checks.
    Verify,
    /// Attempt finished successfully.
    Complete,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradePhase::AbortStale => f.write_str("Abort Stale"),
            UpgradePhase::LocateFiles => f.write_str("Locate Files"),
            UpgradePhase::Transfer => f.write_str("Transfer"),
            UpgradePhase::Restart => f.write_str("Restart"),
            UpgradePhase::Refresh => f.write_str("Refresh"),
            UpgradePhase::Verify => f.write_str("Verify"),
            UpgradePhase::Complete => f.write_str("Complete"),
        }
    }
}

/// Events emitted by an upgrade session.
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    /// Phase changed within the current attempt.
    PhaseChanged { phase: UpgradePhase },
    /// A component transfer started.
    ComponentStarted {
        component: Component,
        filename: String,
    },
    /// Chunk transfer progress for the current component.
    Progress {
        component: Component,
        sent: usize,
        total: usize,
    },
    /// A component passed post-upgrade verification.
    ComponentVerified { component: Component },
    /// An attempt failed and a retry is scheduled.
    RetryScheduled {
        remaining: u32,
        message: String,
        explanation: Option<&'static str>,
    },
    /// The whole upgrade finished.
    Complete,
}

/// Observer trait for receiving upgrade events.
pub trait UpgradeObserver: Send + Sync {
    fn on_event(&self, event: &UpgradeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpgradeObserver for NullObserver {
    fn on_event(&self, _event: &UpgradeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpgradeObserver for TracingObserver {
    fn on_event(&self, event: &UpgradeEvent) {
        match event {
            UpgradeEvent::PhaseChanged { phase } => {
                tracing::info!(phase = %phase, "phase changed");
            }
            UpgradeEvent::ComponentStarted {
                component,
                filename,
            } => {
                tracing::info!(component = %component, file = %filename, "component transfer started");
            }
            UpgradeEvent::Progress {
                component,
                sent,
                total,
            } => {
                let pct = if *total > 0 { sent * 100 / total } else { 100 };
                tracing::debug!(component = %component, progress = %format!("{pct}%"), "DFU");
            }
            UpgradeEvent::ComponentVerified { component } => {
                tracing::info!(component = %component, "verified");
            }
            UpgradeEvent::RetryScheduled {
                remaining,
                message,
                explanation,
            } => {
                tracing::error!("Error: {message}");
                if let Some(explanation) = explanation {
                    tracing::error!("Reason: {explanation}");
                }
                tracing::error!("Attempts remaining: {remaining}");
            }
            UpgradeEvent::Complete => {
                tracing::info!("upgrade complete");
            }
        }
    }
}
