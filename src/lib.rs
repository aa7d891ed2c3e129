//! sleepwalkd - Power-management daemon for handheld Linux devices
//!
//! Decides from hardware state and user-presence signals when the device may
//! suspend, arms an RTC wake alarm, and drives the suspend transition
//! through systemd. An unprivileged companion process watches desktop
//! notifications and session inhibitors so either can veto sleep.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐   ┌──────────────────────────────┐
//! │          sleepwalkd           │   │      sleepwalk-inhibitd      │
//! ├───────────────────────────────┤   ├──────────────────────────────┤
//! │ FSM engine │ Controller       │◄──┤ Inhibitor set │ Notify watch │
//! ├────────────┴──────────────────┤sck├──────────────────────────────┤
//! │ sysfs │ RTC │ systemd (D-Bus) │   │     session bus (D-Bus)      │
//! └───────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Each process is one single-threaded event loop; all inputs (polling,
//! timers, socket, bus signals, bridged OS signals) arrive as discrete
//! events, so the state machine's transitions need no locking.

pub mod config;
pub mod controller;
pub mod fsm;
pub mod hardware;
pub mod inhibit;
pub mod protocol;
pub mod rtc;
pub mod signals;
pub mod systemd;
