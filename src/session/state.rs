//! Connection lifecycle state machine.
//!
//! ```text
//! Connecting ──bind──▶ Authenticated ─┐
//!      │        └────▶ Anonymous ─────┴─open──▶ Open ──▶ Closing ──▶ Closed
//!      └──────────────────────────── refused ─────────────────────────▲
//! ```

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket accepted; the authenticator has not decided yet.
    Connecting,
    /// Authenticator returned a principal.
    Authenticated,
    /// Authenticator found no credentials.
    Anonymous,
    /// Envelope frames are accepted.
    Open,
    /// No new local requests; pending responses still processed.
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Anonymous => "ANONYMOUS",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Validated transitions over [`ConnectionState`].
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    authenticated: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            authenticated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the handshake produced a principal.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record the authentication decision. Allowed once, from `Connecting`.
    pub fn bind(&mut self, authenticated: bool) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Connecting {
            return Err(ProtocolError::InvalidState(self.state));
        }
        self.authenticated = authenticated;
        self.state = if authenticated {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Anonymous
        };
        Ok(())
    }

    pub fn open(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Authenticated | ConnectionState::Anonymous => {
                self.state = ConnectionState::Open;
                Ok(())
            }
            other => Err(ProtocolError::InvalidState(other)),
        }
    }

    /// Enter `Closing`. Returns false if already closing or closed.
    pub fn begin_closing(&mut self) -> bool {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => false,
            _ => {
                self.state = ConnectionState::Closing;
                true
            }
        }
    }

    /// Enter `Closed`. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        true
    }

    /// Frames may be decoded only once the connection is open.
    pub fn check_frame(&self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Open | ConnectionState::Closing => Ok(()),
            other => Err(ProtocolError::InvalidState(other)),
        }
    }

    /// Inbound requests are dispatched only while fully open.
    pub fn accepts_requests(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticated_lifecycle() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Connecting);
        sm.bind(true).unwrap();
        assert_eq!(sm.state(), ConnectionState::Authenticated);
        assert!(sm.is_authenticated());
        sm.open().unwrap();
        assert!(sm.accepts_requests());
        assert!(sm.begin_closing());
        assert!(!sm.accepts_requests());
        assert!(sm.check_frame().is_ok());
        assert!(sm.close());
        assert!(!sm.close());
    }

    #[test]
    fn frames_rejected_before_open() {
        let mut sm = StateMachine::new();
        assert_eq!(
            sm.check_frame(),
            Err(ProtocolError::InvalidState(ConnectionState::Connecting))
        );
        sm.bind(false).unwrap();
        assert_eq!(sm.state(), ConnectionState::Anonymous);
        assert!(sm.check_frame().is_err());
    }

    #[test]
    fn bind_runs_once() {
        let mut sm = StateMachine::new();
        sm.bind(false).unwrap();
        assert!(sm.bind(true).is_err());
        assert!(!sm.is_authenticated());
    }

    #[test]
    fn open_requires_decision() {
        let mut sm = StateMachine::new();
        assert!(sm.open().is_err());
    }

    #[test]
    fn refused_handshake_goes_straight_to_closed() {
        let mut sm = StateMachine::new();
        assert!(sm.close());
        assert_eq!(sm.state(), ConnectionState::Closed);
        assert!(!sm.begin_closing());
        assert!(sm.check_frame().is_err());
    }
}
