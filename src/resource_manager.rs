//! The small, abstract resource-manager surface this crate consumes.
//!
//! The real implementation is a thin wrapper around the `pcsc` crate's
//! binding to the system's PC/SC daemon. Tests substitute a mock
//! implementation that simulates reader fleets and card traffic without
//! any hardware, the way the teacher's integration tests drive the NBD
//! server binary over a loopback connection instead of a real block
//! device.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use bitflags::bitflags;
use log::warn;

use crate::error::HostError;

bitflags! {
    /// Mirrors the PC/SC `SCARD_STATE_*` bit values this crate cares about.
    pub struct StateBits: u32 {
        const UNAWARE = 0x0000;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const UNAVAILABLE = 0x0008;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
    }
}

bitflags! {
    pub struct ProtocolMask: u8 {
        const T0 = 0b01;
        const T1 = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    T0,
    T1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    Shared,
    Exclusive,
    Direct,
}

impl ShareMode {
    /// Decode the wire `p` field; `SHARED` is the default when absent.
    /// Matches the raw PC/SC share-mode constants the original passes
    /// straight through to `SCardConnect` (`SCARD_SHARE_EXCLUSIVE = 1`,
    /// `SCARD_SHARE_SHARED = 2`, `SCARD_SHARE_DIRECT = 3`).
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            1 => Some(ShareMode::Exclusive),
            2 => Some(ShareMode::Shared),
            3 => Some(ShareMode::Direct),
            _ => None,
        }
    }
}

/// A stable, opaque reference to an open card session. `0` is never
/// issued — callers represent "closed" as `Option<CardHandle>` being
/// `None`, mirroring the spec's "handle = 0 ⇔ closed" invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardHandle(pub(crate) u64);

#[derive(Debug, Clone)]
pub struct ReaderStatus {
    pub name: String,
    pub current_state: StateBits,
    pub event_state: StateBits,
    pub atr: Vec<u8>,
}

impl ReaderStatus {
    pub fn unaware(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_state: StateBits::UNAWARE,
            event_state: StateBits::UNAWARE,
            atr: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderListOutcome {
    Readers(Vec<String>),
    NoReaders,
    ServiceStopped,
}

/// The operations §6.3 assumes the resource manager provides.
pub trait ResourceManager {
    fn establish_context(&mut self) -> Result<(), HostError>;
    fn release_context(&mut self);
    fn list_readers(&mut self) -> Result<ReaderListOutcome, HostError>;
    fn get_status_change(
        &mut self,
        timeout_ms: i32,
        states: &mut [ReaderStatus],
    ) -> Result<(), HostError>;
    fn connect(
        &mut self,
        name: &str,
        share_mode: ShareMode,
        protocols: ProtocolMask,
    ) -> Result<(CardHandle, Option<Protocol>), HostError>;
    fn disconnect(&mut self, handle: CardHandle) -> Result<(), HostError>;
    fn transmit(
        &mut self,
        handle: CardHandle,
        protocol: Option<Protocol>,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, HostError>;
}

/// The production `ResourceManager`, backed by the `pcsc` crate's binding
/// to the platform's PC/SC daemon (pcsclite on Linux/macOS, WinSCard on
/// Windows).
pub struct PcscResourceManager {
    context: Option<pcsc::Context>,
    cards: HashMap<u64, (pcsc::Card, Protocol)>,
    next_handle: u64,
}

impl Default for PcscResourceManager {
    fn default() -> Self {
        Self {
            context: None,
            cards: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl PcscResourceManager {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_pcsc_share_mode(mode: ShareMode) -> pcsc::ShareMode {
    match mode {
        ShareMode::Shared => pcsc::ShareMode::Shared,
        ShareMode::Exclusive => pcsc::ShareMode::Exclusive,
        ShareMode::Direct => pcsc::ShareMode::Direct,
    }
}

fn to_pcsc_protocols(mask: ProtocolMask) -> pcsc::Protocols {
    let mut protocols = pcsc::Protocols::empty();
    if mask.contains(ProtocolMask::T0) {
        protocols |= pcsc::Protocols::T0;
    }
    if mask.contains(ProtocolMask::T1) {
        protocols |= pcsc::Protocols::T1;
    }
    protocols
}

impl ResourceManager for PcscResourceManager {
    fn establish_context(&mut self) -> Result<(), HostError> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        self.context = Some(ctx);
        Ok(())
    }

    fn release_context(&mut self) {
        self.cards.clear();
        if let Some(ctx) = self.context.take() {
            if let Err((_ctx, err)) = ctx.release() {
                warn!("releasing PC/SC context failed: {err}");
            }
        }
    }

    fn list_readers(&mut self) -> Result<ReaderListOutcome, HostError> {
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| HostError::Protocol("no PC/SC context established".into()))?;
        let mut buf = vec![0u8; 4096];
        match ctx.list_readers(&mut buf) {
            Ok(iter) => {
                let names: Vec<String> = iter.map(|s| s.to_string_lossy().into_owned()).collect();
                Ok(ReaderListOutcome::Readers(names))
            }
            Err(pcsc::Error::NoReadersAvailable) => Ok(ReaderListOutcome::NoReaders),
            Err(pcsc::Error::ServiceStopped) | Err(pcsc::Error::NoService) => {
                Ok(ReaderListOutcome::ServiceStopped)
            }
            Err(e) => Err(HostError::Pcsc(e)),
        }
    }

    fn get_status_change(
        &mut self,
        timeout_ms: i32,
        states: &mut [ReaderStatus],
    ) -> Result<(), HostError> {
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| HostError::Protocol("no PC/SC context established".into()))?;
        let mut pcsc_states: Vec<pcsc::ReaderState> = states
            .iter()
            .map(|s| {
                let name = CString::new(s.name.clone()).unwrap_or_default();
                pcsc::ReaderState::new(name, to_pcsc_state(s.current_state))
            })
            .collect();
        let timeout = if timeout_ms < 0 {
            Duration::from_millis(u64::MAX)
        } else {
            Duration::from_millis(timeout_ms as u64)
        };
        ctx.get_status_change(timeout, &mut pcsc_states)?;
        for (status, pcsc_state) in states.iter_mut().zip(pcsc_states.iter()) {
            status.event_state = from_pcsc_state(pcsc_state.event_state());
            status.atr = pcsc_state.atr().to_vec();
        }
        Ok(())
    }

    fn connect(
        &mut self,
        name: &str,
        share_mode: ShareMode,
        protocols: ProtocolMask,
    ) -> Result<(CardHandle, Option<Protocol>), HostError> {
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| HostError::Protocol("no PC/SC context established".into()))?;
        let cname = CString::new(name).map_err(|_| HostError::Protocol("NUL in reader name".into()))?;
        let card = ctx.connect(&cname, to_pcsc_share_mode(share_mode), to_pcsc_protocols(protocols))?;
        let protocol = if share_mode == ShareMode::Direct {
            None
        } else {
            let status = card.status2_owned()?;
            Some(match status.protocol() {
                Some(pcsc::Protocols::T1) => Protocol::T1,
                _ => Protocol::T0,
            })
        };
        let id = self.next_handle;
        self.next_handle += 1;
        self.cards.insert(id, (card, protocol.unwrap_or(Protocol::T0)));
        Ok((CardHandle(id), protocol))
    }

    fn disconnect(&mut self, handle: CardHandle) -> Result<(), HostError> {
        if let Some((card, _)) = self.cards.remove(&handle.0) {
            if let Err((_card, err)) = card.disconnect(pcsc::Disposition::LeaveCard) {
                return Err(HostError::Pcsc(err));
            }
        }
        Ok(())
    }

    fn transmit(
        &mut self,
        handle: CardHandle,
        protocol: Option<Protocol>,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, HostError> {
        let (card, negotiated) = self
            .cards
            .get(&handle.0)
            .ok_or_else(|| HostError::Protocol("transmit on closed connection".into()))?;
        let _ = protocol.unwrap_or(*negotiated);
        let response = card.transmit(send, recv)?;
        Ok(response.len())
    }
}

fn to_pcsc_state(bits: StateBits) -> pcsc::State {
    let mut state = pcsc::State::empty();
    if bits.contains(StateBits::CHANGED) {
        state |= pcsc::State::CHANGED;
    }
    if bits.contains(StateBits::EMPTY) {
        state |= pcsc::State::EMPTY;
    }
    if bits.contains(StateBits::PRESENT) {
        state |= pcsc::State::PRESENT;
    }
    if bits.contains(StateBits::UNKNOWN) {
        state |= pcsc::State::UNKNOWN;
    }
    if bits.contains(StateBits::UNAVAILABLE) {
        state |= pcsc::State::UNAVAILABLE;
    }
    state
}

fn from_pcsc_state(state: pcsc::State) -> StateBits {
    let mut bits = StateBits::empty();
    if state.contains(pcsc::State::CHANGED) {
        bits |= StateBits::CHANGED;
    }
    if state.contains(pcsc::State::EMPTY) {
        bits |= StateBits::EMPTY;
    }
    if state.contains(pcsc::State::PRESENT) {
        bits |= StateBits::PRESENT;
    }
    if state.contains(pcsc::State::UNKNOWN) {
        bits |= StateBits::UNKNOWN;
    }
    if state.contains(pcsc::State::UNAVAILABLE) {
        bits |= StateBits::UNAVAILABLE;
    }
    bits
}
