//! End-to-end controller scenarios against a scratch sysfs tree

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sleepwalkd::config::Config;
use sleepwalkd::controller::{Controller, LoopEvent, PowerState};
use sleepwalkd::hardware::DeviceMap;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!(
        "/tmp/sleepwalkd-test-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scratch endpoints: power absent, display off, keyboard present but idle
fn scratch_devices(dir: &PathBuf) -> DeviceMap {
    for (name, value) in [
        ("psu", "0\n"),
        ("display", "1\n"),
        ("keyboard", "0\n"),
        ("led_red", ""),
        ("led_blue", ""),
        ("led_green", ""),
        ("sleep_state", ""),
    ] {
        std::fs::write(dir.join(name), value).unwrap();
    }

    DeviceMap::from_paths([
        dir.join("psu"),
        dir.join("display"),
        dir.join("keyboard"),
        dir.join("led_red"),
        dir.join("led_blue"),
        dir.join("led_green"),
        dir.join("sleep_state"),
    ])
}

fn new_controller(dir: &PathBuf) -> Controller {
    let config = Config {
        sleep_time: Duration::from_millis(600_000),
        wake_time: Duration::from_millis(60_000),
    };
    let mut controller = Controller::new(scratch_devices(dir), config).unwrap();
    controller.begin();
    controller
}

fn job_removed(id: u32, path: &str) -> LoopEvent {
    LoopEvent::JobRemoved {
        id,
        path: path.to_string(),
        unit: "suspend.target".to_string(),
        result: "done".to_string(),
    }
}

#[test]
fn full_sleep_cycle_with_growing_backoff() {
    let dir = unique_test_dir();
    let mut controller = new_controller(&dir);

    // Nothing keeping us awake: the poll changes no state
    controller.dispatch(LoopEvent::PollTick);
    assert_eq!(controller.current_state(), PowerState::Awake);

    // Eligibility timer fires: first sleep, base duration (cycle 0 clamps
    // to 1)
    controller.dispatch(LoopEvent::SleepTimer);
    assert_eq!(controller.current_state(), PowerState::Sleep);
    let request = controller.take_suspend_request().unwrap();
    assert_eq!(request.seconds, 600);
    controller.record_job("/org/freedesktop/systemd1/job/1".to_string());

    // systemd reports the suspend job gone: we are back from suspend
    controller.dispatch(job_removed(1, "/org/freedesktop/systemd1/job/1"));
    assert_eq!(controller.current_state(), PowerState::Sleepwalking);
    assert_eq!(controller.sleep_cycle(), 1);

    // Still nothing keeping us awake: second sleep at 1x
    controller.dispatch(LoopEvent::SleepTimer);
    assert_eq!(controller.take_suspend_request().unwrap().seconds, 600);
    controller.record_job("/org/freedesktop/systemd1/job/2".to_string());
    controller.dispatch(job_removed(2, "/org/freedesktop/systemd1/job/2"));
    assert_eq!(controller.sleep_cycle(), 2);

    // Third sleep doubles the backoff
    controller.dispatch(LoopEvent::SleepTimer);
    assert_eq!(controller.take_suspend_request().unwrap().seconds, 1200);
}

#[test]
fn wakeup_during_sleepwalking_resets_backoff() {
    let dir = unique_test_dir();
    let mut controller = new_controller(&dir);

    controller.dispatch(LoopEvent::SleepTimer);
    controller.record_job("/org/freedesktop/systemd1/job/1".to_string());
    controller.dispatch(job_removed(1, "/org/freedesktop/systemd1/job/1"));
    assert_eq!(controller.sleep_cycle(), 1);

    // User plugs the charger in while sleepwalking
    std::fs::write(dir.join("psu"), "1\n").unwrap();
    controller.dispatch(LoopEvent::PollTick);
    assert_eq!(controller.current_state(), PowerState::Awake);
    assert_eq!(controller.sleep_cycle(), 0);

    // Unplugged again: next sleep starts from the base duration
    std::fs::write(dir.join("psu"), "0\n").unwrap();
    controller.dispatch(LoopEvent::SleepTimer);
    assert_eq!(controller.take_suspend_request().unwrap().seconds, 600);
}

#[test]
fn notification_restarts_backoff_while_sleepwalking() {
    let dir = unique_test_dir();
    let mut controller = new_controller(&dir);

    controller.dispatch(LoopEvent::SleepTimer);
    controller.record_job("/org/freedesktop/systemd1/job/1".to_string());
    controller.dispatch(job_removed(1, "/org/freedesktop/systemd1/job/1"));
    assert_eq!(controller.sleep_cycle(), 1);

    controller.dispatch(LoopEvent::SocketLine("notify".to_string()));
    assert_eq!(controller.current_state(), PowerState::Notify);
    assert_eq!(controller.sleep_cycle(), 0);

    // The fresh notification does not wake the device; sleep pressure
    // continues and the next cycle uses the base duration again
    controller.dispatch(LoopEvent::SleepTimer);
    assert_eq!(controller.current_state(), PowerState::Sleep);
    assert_eq!(controller.take_suspend_request().unwrap().seconds, 600);
}

#[test]
fn inhibit_token_keeps_the_device_awake() {
    let dir = unique_test_dir();
    let mut controller = new_controller(&dir);

    controller.dispatch(LoopEvent::SleepTimer);
    assert!(controller.take_suspend_request().is_some());
    controller.record_job("/org/freedesktop/systemd1/job/1".to_string());
    controller.dispatch(job_removed(1, "/org/freedesktop/systemd1/job/1"));
    assert_eq!(controller.current_state(), PowerState::Sleepwalking);

    // Waking up on the inhibit token must not schedule another suspend
    controller.dispatch(LoopEvent::SocketLine("inhibit".to_string()));
    assert_eq!(controller.current_state(), PowerState::Awake);
    assert!(controller.take_suspend_request().is_none());
}

#[test]
fn foreign_job_completions_do_not_disturb_sleep() {
    let dir = unique_test_dir();
    let mut controller = new_controller(&dir);

    controller.dispatch(LoopEvent::SleepTimer);
    controller.record_job("/org/freedesktop/systemd1/job/5".to_string());

    controller.dispatch(job_removed(9, "/org/freedesktop/systemd1/job/9"));
    assert_eq!(controller.current_state(), PowerState::Sleep);
    assert_eq!(controller.sleep_cycle(), 0);

    // The real completion still lands
    controller.dispatch(job_removed(5, "/org/freedesktop/systemd1/job/5"));
    assert_eq!(controller.current_state(), PowerState::Sleepwalking);
    assert_eq!(controller.sleep_cycle(), 1);
}
