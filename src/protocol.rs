//! Socket protocol between the controller and the inhibit companion
//!
//! The controller listens on a Unix socket; the companion connects and sends
//! newline-terminated ASCII tokens. Two tokens exist: `inhibit` (an inhibitor
//! is currently held: a presence token, re-sent every second while the
//! condition lasts) and `notify` (a desktop notification was just observed).
//! Anything else is ignored.

pub const SOCKET_PATH: &str = "/run/sleepwalkd.sock";

const INHIBIT_TOKEN: &str = "inhibit";
const NOTIFY_TOKEN: &str = "notify";

/// A recognized protocol token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// An inhibitor is held; sleep should be vetoed
    Inhibit,
    /// A desktop notification was observed
    Notify,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inhibit => INHIBIT_TOKEN,
            Self::Notify => NOTIFY_TOKEN,
        }
    }

    /// The wire form, newline-terminated
    pub fn as_line(&self) -> String {
        format!("{}\n", self.as_str())
    }

    /// Parse one received line; unknown tokens yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            INHIBIT_TOKEN => Some(Self::Inhibit),
            NOTIFY_TOKEN => Some(Self::Notify),
            _ => None,
        }
    }
}
