//! Real-time-clock wake alarm
//!
//! Programs /dev/rtc0 so the hardware fires at an absolute UTC instant,
//! waking the device out of system suspend. Adapted from util-linux
//! rtcwake's use of the RTC_WKALM_SET ioctl. The RTC is assumed to run on
//! UTC; the daemon forces TZ=UTC at startup to match.
//!
//! Failure here is fatal to a pending sleep: suspending without a wake
//! alarm risks never waking up again.

use std::fs::File;
use std::os::fd::AsRawFd;

use chrono::{DateTime, Datelike, Timelike, Utc};

const RTC_DEVICE: &str = "/dev/rtc0";

/// struct rtc_time from linux/rtc.h (tm without tm_gmtoff/tm_zone)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcTime {
    pub tm_sec: libc::c_int,
    pub tm_min: libc::c_int,
    pub tm_hour: libc::c_int,
    pub tm_mday: libc::c_int,
    pub tm_mon: libc::c_int,
    pub tm_year: libc::c_int,
    pub tm_wday: libc::c_int,
    pub tm_yday: libc::c_int,
    pub tm_isdst: libc::c_int,
}

/// struct rtc_wkalrm from linux/rtc.h
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcWakeAlarm {
    pub enabled: libc::c_uchar,
    pub pending: libc::c_uchar,
    pub time: RtcTime,
}

// RTC_WKALM_SET = _IOW('p', 0x0f, struct rtc_wkalrm)
nix::ioctl_write_ptr!(rtc_wkalm_set, b'p', 0x0f, RtcWakeAlarm);

#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    #[error("failed to open /dev/rtc0: {0}")]
    Open(std::io::Error),

    #[error("failed to set wake alarm: {0}")]
    SetAlarm(nix::Error),
}

/// Arm the wake alarm to fire at `wake_at`
pub fn arm(wake_at: DateTime<Utc>) -> Result<(), RtcError> {
    let rtc = File::open(RTC_DEVICE).map_err(RtcError::Open)?;

    let alarm = wake_alarm(wake_at);
    unsafe { rtc_wkalm_set(rtc.as_raw_fd(), &alarm) }.map_err(RtcError::SetAlarm)?;

    log::info!("wake alarm set for {}", wake_at.to_rfc3339());
    Ok(())
}

/// Fill the kernel alarm struct from a UTC instant
fn wake_alarm(wake_at: DateTime<Utc>) -> RtcWakeAlarm {
    let mut alarm = RtcWakeAlarm::default();
    alarm.enabled = 1;
    alarm.time.tm_sec = wake_at.second() as libc::c_int;
    alarm.time.tm_min = wake_at.minute() as libc::c_int;
    alarm.time.tm_hour = wake_at.hour() as libc::c_int;
    alarm.time.tm_mday = wake_at.day() as libc::c_int;
    alarm.time.tm_mon = wake_at.month0() as libc::c_int;
    alarm.time.tm_year = wake_at.year() - 1900;
    alarm.time.tm_wday = -1;
    alarm.time.tm_yday = -1;
    alarm.time.tm_isdst = -1;
    alarm
}
