//! systemd D-Bus client
//!
//! The controller asks systemd to enter suspend by starting suspend.target
//! with the "replace" job mode, and watches the Manager's JobRemoved signal
//! for the completion of that job, which for a suspend job is observed
//! after resume. Signals are only emitted to subscribed peers, so
//! `subscribe` must be called once at startup.

use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

/// Unit started to enter system suspend
pub const SUSPEND_UNIT: &str = "suspend.target";

/// Job mode: replace conflicting queued jobs
pub const JOB_MODE_REPLACE: &str = "replace";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
pub trait SystemdManager {
    /// Enqueue a start job for `name`; returns the job object path
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Enable signal emission towards this peer
    fn subscribe(&self) -> zbus::Result<()>;

    /// Emitted when a job is dequeued, with its result
    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: String,
        result: String,
    ) -> zbus::Result<()>;
}
