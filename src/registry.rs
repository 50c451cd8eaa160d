//! The reader fleet: the set of readers PC/SC currently reports, kept in
//! sync by repeated fetch-and-diff cycles rather than any single
//! subscribe/notify primitive, since PC/SC itself offers none.

use log::{info, warn};

use crate::connection::Connection;
use crate::error::HostError;
use crate::resource_manager::{ReaderListOutcome, ReaderStatus, ResourceManager, StateBits};

pub struct ReaderEntry {
    pub name: String,
    pub state: StateBits,
    pub atr: Vec<u8>,
    pub connection: Connection,
}

impl ReaderEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            state: StateBits::UNAWARE,
            atr: Vec::new(),
            connection: Connection::new(),
        }
    }
}

/// What changed between two fetches of the reader fleet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// PC/SC reported the service itself is down; the registry was
    /// cleared and the context re-established. Readers are assumed gone
    /// until the next successful fetch repopulates them.
    pub service_stopped: bool,
}

impl FleetDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.service_stopped
    }
}

pub struct ReaderRegistry {
    readers: Vec<ReaderEntry>,
    /// Suppresses emitting `readers-added`/`readers-removed` for the very
    /// first fetch after startup: the initial fleet is reported back as
    /// the response to `list-readers`, not as unsolicited events.
    fetched_once: bool,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
            fetched_once: false,
        }
    }

    pub fn readers(&self) -> &[ReaderEntry] {
        &self.readers
    }

    pub fn get(&self, index: usize) -> Option<&ReaderEntry> {
        self.readers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ReaderEntry> {
        self.readers.get_mut(index)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.readers.iter().any(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.name.clone()).collect()
    }

    /// Ask the resource manager for the current fleet and reconcile it
    /// against what we already know about. Per the fetch-and-diff
    /// contract, membership is compared by *count*, not by content: an
    /// unchanged count leaves the registry untouched (even if the set of
    /// names actually differs — a reader swapped for another between two
    /// fetches is invisible). A changed count rebuilds the registry from
    /// scratch in PC/SC's reported order, force-closing every previously
    /// open connection, not just the one belonging to a departed reader.
    pub fn fetch_and_diff(
        &mut self,
        rm: &mut dyn ResourceManager,
    ) -> Result<FleetDiff, HostError> {
        let outcome = rm.list_readers()?;

        let current_names = match outcome {
            ReaderListOutcome::Readers(names) => names,
            ReaderListOutcome::NoReaders => Vec::new(),
            ReaderListOutcome::ServiceStopped => {
                warn!("PC/SC service stopped; re-establishing context");
                let removed = self.names();
                self.destroy_all(rm);
                rm.release_context();
                rm.establish_context()?;
                self.fetched_once = false;
                return Ok(FleetDiff {
                    added: Vec::new(),
                    removed,
                    service_stopped: true,
                });
            }
        };

        let first_fetch = !self.fetched_once;
        self.fetched_once = true;

        let old_count = self.readers.len();
        let new_count = current_names.len();

        if !first_fetch && new_count == old_count {
            return Ok(FleetDiff::default());
        }

        let old_names = self.names();
        let added: Vec<String> = current_names
            .iter()
            .filter(|n| !old_names.contains(n))
            .cloned()
            .collect();
        let removed: Vec<String> = old_names
            .iter()
            .filter(|n| !current_names.contains(n))
            .cloned()
            .collect();

        self.destroy_all(rm);
        for name in &current_names {
            self.readers.push(ReaderEntry::new(name.clone()));
        }

        if first_fetch {
            if current_names.is_empty() {
                Ok(FleetDiff::default())
            } else {
                info!("initial reader fleet: {:?}", current_names);
                Ok(FleetDiff {
                    added: current_names,
                    removed: Vec::new(),
                    service_stopped: false,
                })
            }
        } else if new_count > old_count {
            info!("readers added: {:?}", added);
            Ok(FleetDiff {
                added,
                removed: Vec::new(),
                service_stopped: false,
            })
        } else {
            info!("readers removed: {:?}", removed);
            Ok(FleetDiff {
                added: Vec::new(),
                removed,
                service_stopped: false,
            })
        }
    }

    fn destroy_all(&mut self, rm: &mut dyn ResourceManager) {
        for entry in self.readers.iter_mut() {
            entry.connection.force_close(rm);
        }
        self.readers.clear();
    }

    /// Poll the resource manager for card-state changes (0-timeout, never
    /// blocks) and fold the result back into the tracked entries. Returns
    /// one `CardStateChange` per reader whose current/event state bits
    /// show the exact EMPTY-to-PRESENT or PRESENT-to-EMPTY pair and whose
    /// change was not an expected self-inflicted echo.
    pub fn poll_card_states(
        &mut self,
        rm: &mut dyn ResourceManager,
    ) -> Result<Vec<CardStateChange>, HostError> {
        if self.readers.is_empty() {
            return Ok(Vec::new());
        }
        let mut statuses: Vec<ReaderStatus> = self
            .readers
            .iter()
            .map(|r| ReaderStatus {
                name: r.name.clone(),
                current_state: r.state,
                event_state: r.state,
                atr: r.atr.clone(),
            })
            .collect();
        rm.get_status_change(0, &mut statuses)?;

        let mut changes = Vec::new();
        for (i, (entry, status)) in self.readers.iter_mut().zip(statuses.iter()).enumerate() {
            if !status.event_state.contains(StateBits::CHANGED) {
                continue;
            }
            if entry.connection.should_ignore_next_change() {
                entry.state = status.event_state & !StateBits::CHANGED;
                entry.atr = status.atr.clone();
                continue;
            }

            // Requires the exact bit pair, not just the PRESENT bit: an
            // entry starts at UNAWARE (no EMPTY bit), so the first
            // UNAWARE -> PRESENT poll only syncs state and fires no
            // event, and a PRESENT -> UNAVAILABLE transition (neither
            // PRESENT nor EMPTY) fires nothing either.
            let was_empty = entry.state.contains(StateBits::EMPTY);
            let was_present = entry.state.contains(StateBits::PRESENT);
            let now_present = status.event_state.contains(StateBits::PRESENT);
            let now_empty = status.event_state.contains(StateBits::EMPTY);
            if was_empty && now_present {
                changes.push(CardStateChange {
                    index: i,
                    transition: CardTransition::Inserted,
                });
            } else if was_present && now_empty {
                entry.connection.invalidate_on_removal();
                changes.push(CardStateChange {
                    index: i,
                    transition: CardTransition::Removed,
                });
            }
            // SCardGetStatusChange writes the ATR into the reader-state
            // struct as an out-parameter on every call regardless of which
            // transition (if any) is detected above, so this stays
            // unconditional rather than nested in the insert branch.
            entry.atr = status.atr.clone();
            entry.state = status.event_state & !StateBits::CHANGED;
        }
        Ok(changes)
    }
}

pub enum CardTransition {
    Inserted,
    Removed,
}

pub struct CardStateChange {
    pub index: usize,
    pub transition: CardTransition,
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_manager::{CardHandle, Protocol, ProtocolMask, ShareMode};

    struct StubResourceManager {
        outcomes: Vec<ReaderListOutcome>,
    }

    impl ResourceManager for StubResourceManager {
        fn establish_context(&mut self) -> Result<(), HostError> {
            Ok(())
        }
        fn release_context(&mut self) {}
        fn list_readers(&mut self) -> Result<ReaderListOutcome, HostError> {
            Ok(self.outcomes.remove(0))
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
            unreachable!()
        }
        fn disconnect(&mut self, _handle: CardHandle) -> Result<(), HostError> {
            Ok(())
        }
        fn transmit(
            &mut self,
            _handle: CardHandle,
            _protocol: Option<Protocol>,
            _send: &[u8],
            _recv: &mut [u8],
        ) -> Result<usize, HostError> {
            unreachable!()
        }
    }

    #[test]
    fn first_fetch_of_empty_fleet_emits_no_diff() {
        let mut rm = StubResourceManager {
            outcomes: vec![ReaderListOutcome::Readers(Vec::new())],
        };
        let mut registry = ReaderRegistry::new();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert!(diff.is_empty());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn first_fetch_of_non_empty_fleet_emits_readers_added() {
        let mut rm = StubResourceManager {
            outcomes: vec![ReaderListOutcome::Readers(vec!["Reader A".into()])],
        };
        let mut registry = ReaderRegistry::new();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert_eq!(diff.added, vec!["Reader A".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(registry.names(), vec!["Reader A".to_string()]);
    }

    #[test]
    fn unchanged_count_returns_no_diff_even_if_names_differ() {
        let mut rm = StubResourceManager {
            outcomes: vec![
                ReaderListOutcome::Readers(vec!["Reader A".into()]),
                ReaderListOutcome::Readers(vec!["Reader B".into()]),
            ],
        };
        let mut registry = ReaderRegistry::new();
        registry.fetch_and_diff(&mut rm).unwrap();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert!(diff.is_empty());
        // Same-count swap is invisible: the stale name is left in place.
        assert_eq!(registry.names(), vec!["Reader A".to_string()]);
    }

    #[test]
    fn later_fetch_with_more_readers_reports_added() {
        let mut rm = StubResourceManager {
            outcomes: vec![
                ReaderListOutcome::Readers(vec!["Reader A".into()]),
                ReaderListOutcome::Readers(vec!["Reader A".into(), "Reader B".into()]),
            ],
        };
        let mut registry = ReaderRegistry::new();
        registry.fetch_and_diff(&mut rm).unwrap();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert_eq!(diff.added, vec!["Reader B".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(
            registry.names(),
            vec!["Reader A".to_string(), "Reader B".to_string()]
        );
    }

    #[test]
    fn later_fetch_with_fewer_readers_reports_removed() {
        let mut rm = StubResourceManager {
            outcomes: vec![
                ReaderListOutcome::Readers(vec!["Reader A".into(), "Reader B".into()]),
                ReaderListOutcome::Readers(vec!["Reader A".into()]),
            ],
        };
        let mut registry = ReaderRegistry::new();
        registry.fetch_and_diff(&mut rm).unwrap();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec!["Reader B".to_string()]);
    }

    #[test]
    fn service_stopped_clears_registry_and_reestablishes() {
        let mut rm = StubResourceManager {
            outcomes: vec![
                ReaderListOutcome::Readers(vec!["Reader A".into()]),
                ReaderListOutcome::ServiceStopped,
            ],
        };
        let mut registry = ReaderRegistry::new();
        registry.fetch_and_diff(&mut rm).unwrap();
        let diff = registry.fetch_and_diff(&mut rm).unwrap();
        assert!(diff.service_stopped);
        assert_eq!(diff.removed, vec!["Reader A".to_string()]);
        assert!(registry.names().is_empty());
    }
}
