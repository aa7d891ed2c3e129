//! sleepwalk-inhibitd - the unprivileged inhibit companion
//!
//! Runs in the user's session, tracks session-manager inhibitors and
//! observes desktop notifications, and relays both as veto tokens to the
//! controller's socket. Intended to be started alongside sleepwalkd with
//! the session environment already in place.

use std::path::PathBuf;

use clap::Parser;
use nix::sys::signal::Signal;
use zbus::Connection;

use sleepwalkd::inhibit::{self, InhibitCoordinator};
use sleepwalkd::protocol;
use sleepwalkd::signals::SignalBridge;

#[derive(Parser)]
#[command(name = "sleepwalk-inhibitd")]
#[command(about = "Sleep-inhibit companion for sleepwalkd")]
struct Args {
    /// Controller socket to connect to
    #[arg(long, default_value = protocol::SOCKET_PATH)]
    socket: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let session = Connection::session().await?;
    let monitor = inhibit::monitor_notifications().await?;

    let term = SignalBridge::new(Signal::SIGTERM)?;

    let coordinator = InhibitCoordinator::new(args.socket);
    coordinator.run(&session, monitor, term).await?;
    Ok(())
}
