//! sleepwalkd - the privileged power-management controller
//!
//! Detects the device model, binds the companion socket, connects to the
//! systemd system bus and runs the power-state control loop until SIGTERM.
//!
//! Exits nonzero when startup fails or when a pending suspend cannot be
//! armed (wake alarm or suspend request failure).

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use clap::Parser;
use nix::sys::signal::Signal;
use tokio::net::UnixListener;
use zbus::Connection;

use sleepwalkd::config::{Config, DEFAULT_CONFIG_PATH};
use sleepwalkd::controller::Controller;
use sleepwalkd::hardware::DeviceMap;
use sleepwalkd::protocol;
use sleepwalkd::signals::SignalBridge;
use sleepwalkd::systemd::SystemdManagerProxy;

#[derive(Parser)]
#[command(name = "sleepwalkd")]
#[command(about = "Power-management daemon for handheld Linux devices")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listening socket for the inhibit companion
    #[arg(long, default_value = protocol::SOCKET_PATH)]
    socket: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // The RTC alarm is programmed in UTC
    std::env::set_var("TZ", "UTC");

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config)?;
    let devices = DeviceMap::detect()?;

    // Replace any stale socket from a previous run; the companion runs
    // unprivileged, so the socket must be world-accessible
    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)?;
    std::fs::set_permissions(&args.socket, std::fs::Permissions::from_mode(0o666))?;

    let connection = Connection::system().await?;
    let systemd = SystemdManagerProxy::new(&connection).await?;

    let term = SignalBridge::new(Signal::SIGTERM)?;
    let hup = SignalBridge::new(Signal::SIGHUP)?;

    let mut controller = Controller::new(devices, config)?;
    let result = controller.run(listener, systemd, term, hup).await;

    let _ = std::fs::remove_file(&args.socket);
    result.map_err(Into::into)
}
