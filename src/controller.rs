//! Power-state controller
//!
//! Owns the daemon's state machine and fuses every asynchronous source
//! (sysfs polling, timers, the companion socket, systemd's job lifecycle and
//! bridged signals) into FSM events on one event loop:
//!
//! ```text
//!            WakeUp                    GoToSleep
//!   ┌──────────────────────┐   ┌─────────────────────┐
//!   │                      ▼   │                     ▼
//! Sleepwalking ◄─────── Awake ─┘      Sleep ─────► (suspend)
//!   ▲      │ Notify       ▲             │
//!   │      ▼              │ WakeUp      │ EnterSleepwalk
//!   │    Notify ──────────┘             │ (job removed after resume)
//!   └───────────────────────────────────┘
//! ```
//!
//! State-changing side effects run synchronously in the enter hooks, except
//! the suspend request itself: entering Sleep records a pending request that
//! the run loop performs (RTC alarm + StartUnit) once the dispatch has
//! completed, keeping the FSM core free of I/O.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_lite::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;

use crate::config::Config;
use crate::fsm::{self, Hooks, Machine, Outcome, Postbox, StateSpec};
use crate::hardware::{DeviceMap, Endpoint, HardwareError};
use crate::protocol::Token;
use crate::rtc;
use crate::signals::SignalBridge;
use crate::systemd::{SystemdManagerProxy, JOB_MODE_REPLACE, SUSPEND_UNIT};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const BLINK_INTERVAL: Duration = Duration::from_millis(1000);

/// Nodes of the power state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// User present, no sleep pressure
    Awake,
    /// A fresh notification arrived while not awake
    Notify,
    /// Suspended (or about to be); a suspend job is in flight
    Sleep,
    /// Back from a suspend cycle, conditions to stay awake not yet met
    Sleepwalking,
}

/// Events the state machine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerEvent {
    Notify,
    GoToSleep,
    EnterSleepwalk,
    WakeUp,
}

/// Events fed into [`Controller::dispatch`] by the run loop
#[derive(Debug)]
pub enum LoopEvent {
    /// 100 ms sensor poll
    PollTick,
    /// 1000 ms indicator blink step
    BlinkTick,
    /// Sleep-eligibility timer fired
    SleepTimer,
    /// One line received from the companion socket
    SocketLine(String),
    /// systemd dequeued a job
    JobRemoved {
        id: u32,
        path: String,
        unit: String,
        result: String,
    },
    /// SIGHUP: reserved for configuration reload
    Reload,
}

/// A suspend the controller has decided on but not yet issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendRequest {
    /// Absolute instant the RTC must wake the device
    pub wake_at: DateTime<Utc>,
    /// Scheduled sleep length in whole seconds
    pub seconds: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("state machine construction failed: {0}")]
    Machine(#[from] fsm::BuildError<PowerState, PowerEvent>),

    #[error("D-Bus failure: {0}")]
    Dbus(#[from] zbus::Error),

    #[error(transparent)]
    Rtc(#[from] rtc::RtcError),
}

/// Controller state the enter hooks operate on
struct Core {
    devices: DeviceMap,
    config: Config,
    /// Mirror of the machine's active state, for LED policy and gating
    state: PowerState,
    /// Consecutive suspend cycles without a wakeup; drives linear backoff
    sleep_cycle: u32,
    blink_on: bool,
    blink_deadline: Option<Instant>,
    sleep_deadline: Option<Instant>,
    /// Cleared permanently the first time the keyboard endpoint is missing
    keyboard_available: bool,
    pending_suspend: Option<SuspendRequest>,
    /// Path of the single outstanding suspend job
    job: Option<String>,
}

impl Core {
    fn new(devices: DeviceMap, config: Config) -> Self {
        Self {
            devices,
            config,
            state: PowerState::Awake,
            sleep_cycle: 0,
            blink_on: false,
            blink_deadline: None,
            sleep_deadline: None,
            keyboard_available: true,
            pending_suspend: None,
            job: None,
        }
    }

    fn enter_awake(&mut self) {
        if self.blink_deadline.take().is_some() {
            self.blink_on = false;
            self.drive_leds();
        }

        if self.sleep_deadline.is_none() {
            log::info!("awake: cycle {}", self.sleep_cycle);
        }

        // Restarts on every entry: user presence pushes sleep out again
        self.sleep_deadline = Some(Instant::now() + self.config.wake_time);
        self.sleep_cycle = 0;
    }

    /// Notify behaves exactly like Sleepwalking plus a backoff reset, so a
    /// fresh notification restarts the blink and backoff from scratch
    fn enter_notify(&mut self) {
        log::info!("notify");
        self.sleep_cycle = 0;
        self.enter_sleepwalking();
    }

    fn enter_sleepwalking(&mut self) {
        log::info!("sleepwalking: cycle {}", self.sleep_cycle);

        if self.blink_deadline.is_none() {
            self.blink_deadline = Some(Instant::now() + BLINK_INTERVAL);
            self.blink_tick();
        }

        // Leave a running eligibility timer alone: backoff in flight
        if self.sleep_deadline.is_none() {
            self.sleep_deadline = Some(Instant::now() + self.config.wake_time);
        }
    }

    fn enter_sleep(&mut self) {
        let seconds = self.sleep_seconds();
        log::info!("sleep: cycle {}, {} seconds", self.sleep_cycle, seconds);

        self.blink_deadline = None;
        self.blink_on = false;
        self.drive_leds();

        let wake_at = Utc::now() + chrono::Duration::seconds(seconds as i64);
        self.pending_suspend = Some(SuspendRequest { wake_at, seconds });
        // No transition here: the OS suspends, and the next observable
        // event is the job removal after resume
    }

    /// Linear backoff capped at 10x, truncated to whole seconds
    fn sleep_seconds(&self) -> u64 {
        let cycle = u64::from(self.sleep_cycle.clamp(1, 10));
        self.config.sleep_time.as_millis() as u64 * cycle / 1000
    }

    /// Read the sensors once; returns the events the readings imply
    fn poll_sensors(&mut self) -> Vec<PowerEvent> {
        let mut events = Vec::new();

        match self.devices.read_flag(Endpoint::PowerSupply) {
            Ok(true) => events.push(PowerEvent::WakeUp),
            Ok(false) => {}
            Err(e) => log::warn!("power supply poll failed: {}", e),
        }

        if self.keyboard_available {
            match self.devices.read_flag(Endpoint::Keyboard) {
                Ok(true) => events.push(PowerEvent::WakeUp),
                Ok(false) => {}
                Err(HardwareError::Io { ref source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    // Endpoint-availability caching: never retried
                    log::warn!("keyboard endpoint missing, disabling keyboard polling");
                    self.keyboard_available = false;
                }
                Err(e) => log::warn!("keyboard poll failed: {}", e),
            }
        }

        // bl_power reads 0 while the display is on; display on implies
        // user presence
        match self.devices.read_flag(Endpoint::Display) {
            Ok(false) => events.push(PowerEvent::WakeUp),
            Ok(true) => {}
            Err(e) => log::warn!("display poll failed: {}", e),
        }

        events
    }

    /// One blink step: advance the toggle and drive the indicator pattern
    /// for the current state
    fn blink_tick(&mut self) {
        match self.state {
            PowerState::Sleepwalking | PowerState::Notify => self.blink_on = !self.blink_on,
            PowerState::Awake | PowerState::Sleep => self.blink_on = false,
        }
        self.drive_leds();
    }

    fn drive_leds(&self) {
        let (red, green, blue) = match self.state {
            PowerState::Awake => (false, false, false),
            PowerState::Sleep => (false, true, false),
            PowerState::Sleepwalking | PowerState::Notify => (self.blink_on, false, false),
        };

        for (endpoint, on) in [
            (Endpoint::LedRed, red),
            (Endpoint::LedGreen, green),
            (Endpoint::LedBlue, blue),
        ] {
            if let Err(e) = self.devices.write_flag(endpoint, on) {
                log::warn!("indicator write failed: {}", e);
            }
        }
    }
}

impl Hooks<PowerState, PowerEvent> for Core {
    fn on_enter(&mut self, state: PowerState, _postbox: &mut Postbox<PowerEvent>) {
        self.state = state;
        match state {
            PowerState::Awake => self.enter_awake(),
            PowerState::Notify => self.enter_notify(),
            PowerState::Sleep => self.enter_sleep(),
            PowerState::Sleepwalking => self.enter_sleepwalking(),
        }
    }
}

/// The daemon's control core: one FSM instance plus the event loop feeding it
pub struct Controller {
    machine: Machine<PowerState, PowerEvent>,
    core: Core,
}

impl Controller {
    pub fn new(devices: DeviceMap, config: Config) -> Result<Self, ControllerError> {
        // Shared by every state that can still be woken or notified
        let awake_reachable = || {
            StateSpec::new()
                .on(PowerEvent::WakeUp, PowerState::Awake)
                .on(PowerEvent::Notify, PowerState::Notify)
                .on(PowerEvent::GoToSleep, PowerState::Sleep)
        };

        let machine = Machine::builder()
            .initial(PowerState::Awake, awake_reachable())
            .state(PowerState::Notify, awake_reachable())
            .state(PowerState::Sleepwalking, awake_reachable())
            .state(
                PowerState::Sleep,
                StateSpec::new()
                    .on(PowerEvent::WakeUp, PowerState::Awake)
                    .on(PowerEvent::EnterSleepwalk, PowerState::Sleepwalking),
            )
            .build()?;

        Ok(Self {
            machine,
            core: Core::new(devices, config),
        })
    }

    /// Start the machine in Awake
    pub fn begin(&mut self) {
        self.machine.begin(&mut self.core);
    }

    pub fn current_state(&self) -> PowerState {
        self.core.state
    }

    pub fn sleep_cycle(&self) -> u32 {
        self.core.sleep_cycle
    }

    /// Take the suspend decided by the last dispatch, if any
    pub fn take_suspend_request(&mut self) -> Option<SuspendRequest> {
        self.core.pending_suspend.take()
    }

    /// Record the job path returned by the suspend-unit start request
    pub fn record_job(&mut self, path: String) {
        self.core.job = Some(path);
    }

    fn post(&mut self, event: PowerEvent) -> Outcome<PowerState> {
        let outcome = self.machine.post_event(event, &mut self.core);
        match outcome {
            Outcome::Transition { from, to } => {
                log::trace!("{:?}: {:?} -> {:?}", event, from, to)
            }
            Outcome::Rejected => log::trace!("{:?} rejected", event),
            Outcome::Faulted { from } => {
                log::error!("state machine faulted on {:?} in {:?}", event, from)
            }
            Outcome::Ignored | Outcome::Complete { .. } => {}
        }
        outcome
    }

    /// Handle one event from the run loop
    pub fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::PollTick => {
                for event in self.core.poll_sensors() {
                    self.post(event);
                }
            }

            LoopEvent::BlinkTick => {
                if self.core.blink_deadline.is_some() {
                    self.core.blink_tick();
                    self.core.blink_deadline = Some(Instant::now() + BLINK_INTERVAL);
                }
            }

            LoopEvent::SleepTimer => {
                self.core.sleep_deadline = None;
                self.post(PowerEvent::GoToSleep);
            }

            LoopEvent::SocketLine(line) => match Token::parse(&line) {
                Some(Token::Inhibit) => {
                    self.post(PowerEvent::WakeUp);
                }
                Some(Token::Notify) if self.core.state != PowerState::Awake => {
                    self.post(PowerEvent::Notify);
                }
                Some(Token::Notify) => {
                    // No point notifying someone already awake
                }
                None => log::debug!("ignoring socket line {:?}", line),
            },

            LoopEvent::JobRemoved {
                id, path, result, ..
            } => {
                if self.core.job.as_deref() == Some(path.as_str()) {
                    log::info!("suspend job {} removed ({}), waking up", id, result);
                    self.core.job = None;
                    self.core.sleep_cycle += 1;
                    self.post(PowerEvent::EnterSleepwalk);
                }
            }

            LoopEvent::Reload => {
                log::info!("reload requested (configuration reload not implemented)");
            }
        }
    }

    /// Arm the wake alarm and hand the suspend job to systemd.
    ///
    /// Any failure is fatal: continuing would risk an unmonitored sleep.
    async fn suspend(
        &mut self,
        systemd: &SystemdManagerProxy<'_>,
        request: SuspendRequest,
    ) -> Result<(), ControllerError> {
        rtc::arm(request.wake_at)?;

        let job = systemd.start_unit(SUSPEND_UNIT, JOB_MODE_REPLACE).await?;
        log::info!("suspend job queued at {}", job);
        self.record_job(job.to_string());
        Ok(())
    }

    /// Drive the controller until termination is requested
    pub async fn run(
        &mut self,
        listener: UnixListener,
        systemd: SystemdManagerProxy<'_>,
        mut term: SignalBridge,
        mut hup: SignalBridge,
    ) -> Result<(), ControllerError> {
        systemd.subscribe().await?;
        let mut job_removed = systemd.receive_job_removed().await?;

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut client: Option<Lines<BufReader<UnixStream>>> = None;

        self.begin();

        loop {
            let blink = sleep_until_opt(self.core.blink_deadline);
            let eligible = sleep_until_opt(self.core.sleep_deadline);

            tokio::select! {
                _ = poll.tick() => self.dispatch(LoopEvent::PollTick),

                _ = blink => self.dispatch(LoopEvent::BlinkTick),

                _ = eligible => self.dispatch(LoopEvent::SleepTimer),

                conn = listener.accept() => match conn {
                    Ok((stream, _)) => {
                        // A new connection replaces any previous peer
                        log::info!("new socket connection");
                        client = Some(BufReader::new(stream).lines());
                    }
                    Err(e) => log::warn!("socket accept failed: {}", e),
                },

                line = client_line(&mut client) => match line {
                    Ok(Some(line)) => self.dispatch(LoopEvent::SocketLine(line)),
                    Ok(None) => {
                        log::info!("socket peer disconnected");
                        client = None;
                    }
                    Err(e) => {
                        log::warn!("socket read failed: {}", e);
                        client = None;
                    }
                },

                Some(signal) = job_removed.next() => match signal.args() {
                    Ok(args) => self.dispatch(LoopEvent::JobRemoved {
                        id: *args.id(),
                        path: args.job().to_string(),
                        unit: args.unit().clone(),
                        result: args.result().clone(),
                    }),
                    Err(e) => log::warn!("malformed JobRemoved signal: {}", e),
                },

                _ = term.recv() => {
                    log::info!("termination requested");
                    return Ok(());
                }

                _ = hup.recv() => self.dispatch(LoopEvent::Reload),
            }

            if let Some(request) = self.take_suspend_request() {
                self.suspend(&systemd, request).await?;
            }
        }
    }
}

/// Sleep until `deadline`, or forever when no deadline is armed
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read the next line from the active peer; pends while no peer is connected
async fn client_line(
    client: &mut Option<Lines<BufReader<UnixStream>>>,
) -> std::io::Result<Option<String>> {
    match client.as_mut() {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}
