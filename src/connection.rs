//! Per-reader connection state: open/closed, plus the bookkeeping needed
//! to tell a state change we caused ourselves (by connecting or
//! disconnecting) apart from one a real card event caused.

use log::debug;

use crate::error::HostError;
use crate::resource_manager::{CardHandle, Protocol, ProtocolMask, ResourceManager, ShareMode};

/// A reader's card connection. Absence of a handle is "closed"; this
/// mirrors the `hCard == 0` convention the original engine used instead
/// of a separate boolean.
pub struct Connection {
    handle: Option<CardHandle>,
    protocol: Option<Protocol>,
    share_mode: Option<ShareMode>,
    /// Number of upcoming status-change results to treat as
    /// self-inflicted rather than real card events. Incremented only by
    /// `open` (the operation that actually produces a self-echo),
    /// decremented by the event loop as it consumes status updates for
    /// this reader.
    ignore_count: u32,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            handle: None,
            protocol: None,
            share_mode: None,
            ignore_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<CardHandle> {
        self.handle
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn should_ignore_next_change(&mut self) -> bool {
        if self.ignore_count > 0 {
            self.ignore_count -= 1;
            true
        } else {
            false
        }
    }

    /// Open a connection to `name`. Idempotent: calling this while
    /// already open with the same share mode succeeds without touching
    /// PC/SC again, matching the request handler's contract that
    /// `connect` on an already-open reader is not an error.
    pub fn open(
        &mut self,
        rm: &mut dyn ResourceManager,
        name: &str,
        share_mode: ShareMode,
        protocols: ProtocolMask,
    ) -> Result<Option<Protocol>, HostError> {
        if self.is_open() {
            return Ok(self.protocol);
        }
        let (handle, protocol) = rm.connect(name, share_mode, protocols)?;
        self.handle = Some(handle);
        self.protocol = protocol;
        self.share_mode = Some(share_mode);
        self.ignore_count += 1;
        debug!("opened connection to {name} ({share_mode:?}, protocol {protocol:?})");
        Ok(protocol)
    }

    /// Close the connection. Idempotent: closing an already-closed
    /// connection is a no-op, not an error. `SCardDisconnect` with
    /// "leave card" disposition produces no state-change echo, so unlike
    /// `open` this does not arm the ignore-counter — doing so would
    /// swallow the next genuine card event (e.g. the user pulling the
    /// card right after disconnecting).
    pub fn close(&mut self, rm: &mut dyn ResourceManager) -> Result<(), HostError> {
        if let Some(handle) = self.handle.take() {
            rm.disconnect(handle)?;
            self.protocol = None;
            self.share_mode = None;
        }
        Ok(())
    }

    /// Zero the handle without calling the OS disconnect: used when a
    /// card-removal event tells us the underlying session is already
    /// dead, so there is nothing left to close.
    pub fn invalidate_on_removal(&mut self) {
        self.handle = None;
        self.protocol = None;
        self.share_mode = None;
    }

    /// Close without propagating errors upward: used when a reader is
    /// about to disappear from the fleet entirely and there's no one left
    /// to report a failure to.
    pub fn force_close(&mut self, rm: &mut dyn ResourceManager) {
        if let Some(handle) = self.handle.take() {
            let _ = rm.disconnect(handle);
            self.protocol = None;
            self.share_mode = None;
        }
    }

    pub fn transmit(
        &self,
        rm: &mut dyn ResourceManager,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, HostError> {
        let handle = self
            .handle
            .ok_or_else(|| HostError::Protocol("transmit on a closed connection".into()))?;
        rm.transmit(handle, self.protocol, send, recv)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_manager::ReaderListOutcome;
    use crate::resource_manager::ReaderStatus;

    struct StubResourceManager {
        next_handle: u64,
        disconnected: Vec<u64>,
    }

    impl ResourceManager for StubResourceManager {
        fn establish_context(&mut self) -> Result<(), HostError> {
            Ok(())
        }
        fn release_context(&mut self) {}
        fn list_readers(&mut self) -> Result<ReaderListOutcome, HostError> {
            Ok(ReaderListOutcome::NoReaders)
        }
        fn get_status_change(
            &mut self,
            _timeout_ms: i32,
            _states: &mut [ReaderStatus],
        ) -> Result<(), HostError> {
            Ok(())
        }
        fn connect(
            &mut self,
            _name: &str,
            _share_mode: ShareMode,
            _protocols: ProtocolMask,
        ) -> Result<(CardHandle, Option<Protocol>), HostError> {
            self.next_handle += 1;
            Ok((CardHandle(self.next_handle), Some(Protocol::T0)))
        }
        fn disconnect(&mut self, handle: CardHandle) -> Result<(), HostError> {
            self.disconnected.push(handle.0);
            Ok(())
        }
        fn transmit(
            &mut self,
            _handle: CardHandle,
            _protocol: Option<Protocol>,
            _send: &[u8],
            _recv: &mut [u8],
        ) -> Result<usize, HostError> {
            Ok(0)
        }
    }

    #[test]
    fn open_then_open_again_is_idempotent() {
        let mut rm = StubResourceManager {
            next_handle: 0,
            disconnected: Vec::new(),
        };
        let mut conn = Connection::new();
        conn.open(&mut rm, "Reader A", ShareMode::Shared, ProtocolMask::T0)
            .unwrap();
        let handle_before = conn.handle();
        conn.open(&mut rm, "Reader A", ShareMode::Shared, ProtocolMask::T0)
            .unwrap();
        assert_eq!(conn.handle(), handle_before);
        assert_eq!(rm.next_handle, 1);
    }

    #[test]
    fn close_then_close_again_is_idempotent() {
        let mut rm = StubResourceManager {
            next_handle: 0,
            disconnected: Vec::new(),
        };
        let mut conn = Connection::new();
        conn.open(&mut rm, "Reader A", ShareMode::Shared, ProtocolMask::T0)
            .unwrap();
        conn.close(&mut rm).unwrap();
        conn.close(&mut rm).unwrap();
        assert_eq!(rm.disconnected.len(), 1);
        assert!(!conn.is_open());
    }
}
