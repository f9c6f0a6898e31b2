//! Per-peer connection records.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gantry_api::{BackendError, Result};
use gantry_fabric::{FabricAddr, RailManager, RailType};

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt made.
    Disconnected,
    /// Connection request sent, waiting for the acknowledgment.
    ConnectReqSent,
    /// Acknowledgment sent (target side), not yet confirmed connected.
    ConnectAckSent,
    /// Acknowledged and ready for transfers.
    Connected,
    /// Connection attempt failed; terminal until the record is erased.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::ConnectReqSent => "CONNECT_REQ_SENT",
            ConnectionState::ConnectAckSent => "CONNECT_ACK_SENT",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Inserted per-rail addresses for a live connection.
#[derive(Debug, Clone)]
pub struct ConnAddrs {
    /// Data-rail addresses, indexed by rail id.
    pub data: Vec<FabricAddr>,
    /// Control-rail addresses, indexed by rail id.
    pub control: Vec<FabricAddr>,
}

/// One peer (the local agent included): endpoint names, inserted
/// addresses, and the state cell that `connect` blocks on.
pub struct Connection {
    /// Peer agent name.
    pub peer: String,
    /// The peer's index in the local agent table, carried on the wire.
    pub agent_index: u16,
    /// The peer's data-rail endpoint names.
    pub data_ep_names: Vec<String>,
    /// The peer's control-rail endpoint names.
    pub control_ep_names: Vec<String>,
    addrs: Mutex<Option<ConnAddrs>>,
    state: Mutex<ConnectionState>,
    cv: Condvar,
}

impl Connection {
    /// Create a record in `Disconnected` with no inserted addresses.
    pub fn new(
        peer: String,
        agent_index: u16,
        data_ep_names: Vec<String>,
        control_ep_names: Vec<String>,
    ) -> Self {
        Connection {
            peer,
            agent_index,
            data_ep_names,
            control_ep_names,
            addrs: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            cv: Condvar::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Set the state and wake every waiter.
    pub fn set_state(&self, new: ConnectionState) {
        *self.state.lock().unwrap() = new;
        self.cv.notify_all();
    }

    /// Set the state only when the current state matches `expected`;
    /// returns whether the transition happened. Waiters are woken only
    /// on a successful transition.
    pub fn transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != expected {
            return false;
        }
        *state = new;
        drop(state);
        self.cv.notify_all();
        true
    }

    /// Block until the state resolves to `Connected` or `Failed`, or
    /// the timeout passes. Returns the state observed last.
    pub fn wait_resolved(&self, timeout: Duration) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let mut state: MutexGuard<'_, ConnectionState> = self.state.lock().unwrap();
        loop {
            match *state {
                ConnectionState::Connected | ConnectionState::Failed => return *state,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return *state;
            }
            let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Addresses, inserting them on first use after creation or after
    /// a disconnect removed them.
    pub fn ensure_addrs(&self, manager: &RailManager) -> Result<ConnAddrs> {
        let mut addrs = self.addrs.lock().unwrap();
        if let Some(existing) = addrs.as_ref() {
            return Ok(existing.clone());
        }
        let data = manager.insert_all_addresses(RailType::Data, &self.data_ep_names)?;
        let control = manager.insert_all_addresses(RailType::Control, &self.control_ep_names)?;
        let inserted = ConnAddrs { data, control };
        *addrs = Some(inserted.clone());
        Ok(inserted)
    }

    /// Currently inserted addresses, if any.
    pub fn addrs(&self) -> Result<ConnAddrs> {
        self.addrs
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::backend(format!("no addresses for peer {}", self.peer)))
    }

    /// Remove and return the inserted addresses, if any.
    pub fn take_addrs(&self) -> Option<ConnAddrs> {
        self.addrs.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let conn = Connection::new("b".into(), 1, vec![], vec![]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_transition_guards_expected_state() {
        let conn = Connection::new("b".into(), 1, vec![], vec![]);
        assert!(conn.transition(ConnectionState::Disconnected, ConnectionState::ConnectReqSent));
        assert!(!conn.transition(ConnectionState::Disconnected, ConnectionState::Connected));
        assert_eq!(conn.state(), ConnectionState::ConnectReqSent);
    }

    #[test]
    fn test_wait_resolved_times_out() {
        let conn = Connection::new("b".into(), 1, vec![], vec![]);
        let state = conn.wait_resolved(Duration::from_millis(20));
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_wait_resolved_wakes_on_connected() {
        let conn = Arc::new(Connection::new("b".into(), 1, vec![], vec![]));
        let setter = Arc::clone(&conn);
        let waiter = std::thread::spawn(move || conn.wait_resolved(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        setter.set_state(ConnectionState::Connected);
        assert_eq!(waiter.join().unwrap(), ConnectionState::Connected);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConnectionState::ConnectReqSent.to_string(), "CONNECT_REQ_SENT");
        assert_eq!(ConnectionState::Failed.to_string(), "FAILED");
    }
}
