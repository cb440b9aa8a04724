//! The error type shared by the daemon and its hardware backends.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// What can go wrong while supervising the pool. The variants follow
/// the controller's fault lines -- configuration, peripherals, the
/// log store, and the plumbing between tasks -- rather than any one
/// library's error surface, so backends map their failures onto
/// these and callers never match on vendor errors.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The configuration file was missing, unreadable, malformed, or
    /// failed a validation rule. Raised only during startup; the
    /// daemon never runs on a half-loaded configuration.
    Config(String),

    /// A peripheral misbehaved: a GPIO line could not be claimed or
    /// driven, a 1-Wire probe never produced a trustworthy reading,
    /// or a helper binary could not be spawned.
    Hardware(String),

    /// A logical relay port outside the board's 1..8 range.
    BadRelayPort(u8),

    /// The log store refused a connection or a statement. Record
    /// writers treat this as best-effort and keep controlling.
    Store(String),

    /// An internal channel closed because the task on the other end
    /// is gone.
    ChannelClosed(String),

    /// A process facility (signal handling, task setup) could not be
    /// established.
    Internal(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(v) => write!(f, "configuration error: {}", &v),
            Error::Hardware(v) => write!(f, "hardware fault: {}", &v),
            Error::BadRelayPort(port) => {
                write!(f, "relay port {} is not wired (ports are 1-8)", port)
            }
            Error::Store(v) => write!(f, "log store error: {}", &v),
            Error::ChannelClosed(v) => {
                write!(f, "{} channel closed", &v)
            }
            Error::Internal(v) => write!(f, "{}", &v),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Hardware(format!("I/O error: {}", error))
    }
}

// A dropped receiver or a dead replier both mean the same thing to
// the sender: the peer task is gone. Mapping the channel errors here
// lets callers use `?` on sends and replies alike.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed(String::from("request"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::ChannelClosed(String::from("reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_fault() {
        assert_eq!(
            Error::BadRelayPort(9).to_string(),
            "relay port 9 is not wired (ports are 1-8)"
        );
        assert_eq!(
            Error::Config(String::from("'mqttBroker' must not be empty"))
                .to_string(),
            "configuration error: 'mqttBroker' must not be empty"
        );
        assert_eq!(
            Error::Hardware(String::from("gpio busy")).to_string(),
            "hardware fault: gpio busy"
        );
    }
}
