//! Quality-weighted CM server list.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use cmlink_transport::{Endpoint, ProtocolTypes};

use crate::clock::{Clock, SystemClock};

/// Weighting of a server that recently failed
pub const BAD_WEIGHTING: u32 = 1;

/// Weighting of a server with no recent history
pub const BASE_WEIGHTING: u32 = 10;

/// Weighting of a server that recently worked
pub const GOOD_WEIGHTING: u32 = 30;

/// How long a quality mark lasts before decaying to baseline
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Server list errors
#[derive(Debug, Error)]
pub enum ServerListError {
    /// No entry matches the endpoint and protocols
    #[error("{endpoint} ({protocols}) is not in the server list")]
    NotInList {
        /// Endpoint that was looked up
        endpoint: Endpoint,
        /// Protocols that were looked up
        protocols: ProtocolTypes,
    },

    /// Weightings are not strictly ordered `0 < bad < base < good`
    #[error("weightings must satisfy 0 < bad < base < good (got {bad} / {base} / {good})")]
    InvalidWeightings {
        /// Configured bad weighting
        bad: u32,
        /// Configured base weighting
        base: u32,
        /// Configured good weighting
        good: u32,
    },
}

/// Observed connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerQuality {
    /// Connected successfully
    Good,
    /// Failed or dropped
    Bad,
}

/// Weighting constants and decay window
#[derive(Debug, Clone)]
pub struct ServerListConfig {
    /// Weighting after a `Good` mark
    pub good_weighting: u32,
    /// Weighting of unmarked or decayed entries
    pub base_weighting: u32,
    /// Weighting after a `Bad` mark
    pub bad_weighting: u32,
    /// Time after which a mark decays to baseline
    pub validity: Duration,
}

impl Default for ServerListConfig {
    fn default() -> Self {
        Self {
            good_weighting: GOOD_WEIGHTING,
            base_weighting: BASE_WEIGHTING,
            bad_weighting: BAD_WEIGHTING,
            validity: DEFAULT_VALIDITY,
        }
    }
}

impl ServerListConfig {
    /// Check that the weightings are positive and strictly ordered
    ///
    /// # Errors
    ///
    /// Returns [`ServerListError::InvalidWeightings`] otherwise.
    pub fn validate(&self) -> Result<(), ServerListError> {
        let ordered = 0 < self.bad_weighting
            && self.bad_weighting < self.base_weighting
            && self.base_weighting < self.good_weighting;
        if !ordered {
            return Err(ServerListError::InvalidWeightings {
                bad: self.bad_weighting,
                base: self.base_weighting,
                good: self.good_weighting,
            });
        }
        Ok(())
    }

    /// Weighting constant for a quality
    #[must_use]
    pub fn weighting(&self, quality: ServerQuality) -> u32 {
        match quality {
            ServerQuality::Good => self.good_weighting,
            ServerQuality::Bad => self.bad_weighting,
        }
    }
}

/// A server endpoint and the carriers it accepts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerRecord {
    endpoint: Endpoint,
    protocol_types: ProtocolTypes,
}

impl ServerRecord {
    /// Create a record
    #[must_use]
    pub fn new(endpoint: Endpoint, protocol_types: ProtocolTypes) -> Self {
        Self {
            endpoint,
            protocol_types,
        }
    }

    /// Server endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepted carriers
    #[must_use]
    pub fn protocol_types(&self) -> ProtocolTypes {
        self.protocol_types
    }
}

impl fmt::Display for ServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.protocol_types)
    }
}

#[derive(Debug, Clone)]
struct ServerEntry {
    endpoint: Endpoint,
    protocol: ProtocolTypes,
    weighting: u32,
    last_adjusted: Option<Instant>,
}

impl ServerEntry {
    fn is(&self, endpoint: &Endpoint, protocol: ProtocolTypes) -> bool {
        self.protocol == protocol && self.endpoint == *endpoint
    }

    fn record(&self) -> ServerRecord {
        ServerRecord::new(self.endpoint.clone(), self.protocol)
    }
}

/// Server list that prefers servers which recently worked
///
/// Each (endpoint, protocol) pair is an entry with a weighting of exactly one
/// of the bad, base or good constants. Candidates are drawn at random in
/// proportion to their weighting; marks decay back to baseline after the
/// validity window.
pub struct SmartCmServerList {
    config: ServerListConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<ServerEntry>>,
}

impl SmartCmServerList {
    /// Empty list with default weightings
    #[must_use]
    pub fn new() -> Self {
        Self::build(ServerListConfig::default(), Arc::new(SystemClock))
    }

    /// Empty list with custom weightings
    ///
    /// # Errors
    ///
    /// Returns [`ServerListError::InvalidWeightings`] if `config` does not validate.
    pub fn with_config(config: ServerListConfig) -> Result<Self, ServerListError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Empty list with custom weightings and time source
    ///
    /// # Errors
    ///
    /// Returns [`ServerListError::InvalidWeightings`] if `config` does not validate.
    pub fn with_clock(
        config: ServerListConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerListError> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: ServerListConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ServerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_entry(&self, endpoint: &Endpoint, protocol: ProtocolTypes) -> ServerEntry {
        ServerEntry {
            endpoint: endpoint.clone(),
            protocol,
            weighting: self.config.base_weighting,
            last_adjusted: None,
        }
    }

    /// Number of (endpoint, protocol) entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the list has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Add a server's entries that are not yet present
    ///
    /// Returns whether anything was added.
    pub fn try_add(&self, record: &ServerRecord) -> bool {
        let mut entries = self.entries();
        let mut added = false;
        for protocol in record.protocol_types().iter() {
            if entries.iter().any(|e| e.is(record.endpoint(), protocol)) {
                continue;
            }
            entries.push(self.new_entry(record.endpoint(), protocol));
            added = true;
        }
        added
    }

    /// Replace the whole list
    ///
    /// Entries that survive keep their weighting; new ones start at baseline.
    /// Order follows `records`, with duplicates dropped.
    pub fn replace_list<I>(&self, records: I)
    where
        I: IntoIterator<Item = ServerRecord>,
    {
        let mut entries = self.entries();
        let mut replacement: Vec<ServerEntry> = Vec::new();

        for record in records {
            for protocol in record.protocol_types().iter() {
                if replacement.iter().any(|e| e.is(record.endpoint(), protocol)) {
                    continue;
                }
                let entry = entries
                    .iter()
                    .find(|e| e.is(record.endpoint(), protocol))
                    .cloned()
                    .unwrap_or_else(|| self.new_entry(record.endpoint(), protocol));
                replacement.push(entry);
            }
        }

        debug!(
            "server list replaced: {} entries (was {})",
            replacement.len(),
            entries.len()
        );
        *entries = replacement;
    }

    /// Record the outcome of a connection to `endpoint` over `protocols`
    ///
    /// # Errors
    ///
    /// Returns [`ServerListError::NotInList`] if no entry matches.
    pub fn mark(
        &self,
        endpoint: &Endpoint,
        protocols: ProtocolTypes,
        quality: ServerQuality,
    ) -> Result<(), ServerListError> {
        let now = self.clock.now();
        let weighting = self.config.weighting(quality);
        let mut entries = self.entries();

        let mut matched = false;
        for entry in entries
            .iter_mut()
            .filter(|e| e.endpoint == *endpoint && protocols.contains(e.protocol))
        {
            entry.weighting = weighting;
            entry.last_adjusted = Some(now);
            matched = true;
        }

        if !matched {
            return Err(ServerListError::NotInList {
                endpoint: endpoint.clone(),
                protocols,
            });
        }
        debug!("marked {} ({}) as {:?}", endpoint, protocols, quality);
        Ok(())
    }

    /// Put every `Bad` entry back at baseline
    pub fn reset_bad_servers(&self) {
        let bad = self.config.bad_weighting;
        let base = self.config.base_weighting;
        for entry in self.entries().iter_mut().filter(|e| e.weighting == bad) {
            entry.weighting = base;
            entry.last_adjusted = None;
        }
    }

    /// Distinct endpoints, in list order
    #[must_use]
    pub fn all_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for entry in self.entries().iter() {
            if !endpoints.contains(&entry.endpoint) {
                endpoints.push(entry.endpoint.clone());
            }
        }
        endpoints
    }

    /// Every entry with its current weighting, in list order
    #[must_use]
    pub fn weightings(&self) -> Vec<(ServerRecord, u32)> {
        self.entries()
            .iter()
            .map(|e| (e.record(), e.weighting))
            .collect()
    }

    /// Draw a server for one of the carriers in `mask`
    ///
    /// Returns `None` only if no entry matches `mask`.
    #[must_use]
    pub fn next_server_candidate(&self, mask: ProtocolTypes) -> Option<ServerRecord> {
        self.next_server_candidate_with(mask, &mut rand::thread_rng())
    }

    /// [`next_server_candidate`](Self::next_server_candidate) with an explicit RNG
    pub fn next_server_candidate_with<R: Rng + ?Sized>(
        &self,
        mask: ProtocolTypes,
        rng: &mut R,
    ) -> Option<ServerRecord> {
        let candidates = self.snapshot(mask);
        if candidates.is_empty() {
            return None;
        }

        let index = match WeightedIndex::new(candidates.iter().map(|(_, w)| *w)) {
            Ok(dist) => dist.sample(rng),
            Err(e) => {
                warn!("weighted draw unavailable ({}), using list order", e);
                0
            }
        };
        candidates.into_iter().nth(index).map(|(record, _)| record)
    }

    /// Decay stale marks, then copy out the matching entries
    fn snapshot(&self, mask: ProtocolTypes) -> Vec<(ServerRecord, u32)> {
        let now = self.clock.now();
        let validity = self.config.validity;
        let base = self.config.base_weighting;
        let mut entries = self.entries();

        for entry in entries.iter_mut() {
            let stale = entry
                .last_adjusted
                .is_some_and(|at| now.saturating_duration_since(at) > validity);
            if stale {
                debug!(
                    "{} ({}) weighting decayed to baseline",
                    entry.endpoint, entry.protocol
                );
                entry.weighting = base;
                entry.last_adjusted = None;
            }
        }

        entries
            .iter()
            .filter(|e| mask.contains(e.protocol))
            .map(|e| (e.record(), e.weighting))
            .collect()
    }
}

impl Default for SmartCmServerList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SmartCmServerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartCmServerList")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(port: u16, protocols: ProtocolTypes) -> ServerRecord {
        ServerRecord::new(Endpoint::new("127.0.0.1", port), protocols)
    }

    #[test]
    fn test_empty_list_has_no_candidate() {
        let list = SmartCmServerList::new();
        assert!(list.is_empty());
        assert!(list.next_server_candidate(ProtocolTypes::TCP).is_none());
    }

    #[test]
    fn test_all_bad_still_returns_candidate() {
        let list = SmartCmServerList::new();
        let server = record(27015, ProtocolTypes::TCP);
        list.replace_list([server.clone()]);
        list.mark(server.endpoint(), ProtocolTypes::TCP, ServerQuality::Bad)
            .unwrap();
        assert_eq!(list.next_server_candidate(ProtocolTypes::TCP), Some(server));
    }

    #[test]
    fn test_protocol_mask_filtering() {
        let list = SmartCmServerList::new();
        list.replace_list([record(27015, ProtocolTypes::TCP | ProtocolTypes::UDP)]);
        assert_eq!(list.len(), 2);

        let tcp = list.next_server_candidate(ProtocolTypes::TCP).unwrap();
        assert_eq!(tcp.protocol_types(), ProtocolTypes::TCP);
        let udp = list.next_server_candidate(ProtocolTypes::UDP).unwrap();
        assert_eq!(udp.protocol_types(), ProtocolTypes::UDP);
        assert!(list.next_server_candidate(ProtocolTypes::WEB_SOCKET).is_none());
        assert!(list.next_server_candidate(ProtocolTypes::ALL).is_some());

        list.replace_list([record(443, ProtocolTypes::WEB_SOCKET)]);
        assert!(list.next_server_candidate(ProtocolTypes::TCP).is_none());
        assert!(list.next_server_candidate(ProtocolTypes::TCP | ProtocolTypes::UDP).is_none());
        assert_eq!(
            list.next_server_candidate(ProtocolTypes::WEB_SOCKET)
                .unwrap()
                .endpoint()
                .port(),
            443
        );
    }

    #[test]
    fn test_try_add_is_idempotent() {
        let list = SmartCmServerList::new();
        assert!(list.try_add(&record(1, ProtocolTypes::TCP)));
        assert!(!list.try_add(&record(1, ProtocolTypes::TCP)));
        assert!(list.try_add(&record(1, ProtocolTypes::TCP | ProtocolTypes::UDP)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.all_endpoints().len(), 1);
    }

    #[test]
    fn test_mark_unknown_fails() {
        let list = SmartCmServerList::new();
        list.replace_list([record(27015, ProtocolTypes::TCP)]);

        let err = list
            .mark(&Endpoint::new("127.0.0.1", 27016), ProtocolTypes::TCP, ServerQuality::Good)
            .unwrap_err();
        assert!(matches!(err, ServerListError::NotInList { .. }));
        assert!(
            list.mark(&Endpoint::new("127.0.0.1", 27015), ProtocolTypes::UDP, ServerQuality::Good)
                .is_err()
        );
    }

    #[test]
    fn test_protocols_marked_individually() {
        let list = SmartCmServerList::new();
        let both = ProtocolTypes::TCP | ProtocolTypes::UDP;
        list.replace_list([record(27015, both), record(27016, both)]);

        list.mark(&Endpoint::new("127.0.0.1", 27015), ProtocolTypes::TCP, ServerQuality::Bad)
            .unwrap();

        let weights = list.weightings();
        assert_eq!(weights[0], (record(27015, ProtocolTypes::TCP), BAD_WEIGHTING));
        assert_eq!(weights[1], (record(27015, ProtocolTypes::UDP), BASE_WEIGHTING));
        assert_eq!(weights[2].1, BASE_WEIGHTING);
    }

    #[test]
    fn test_replace_keeps_weightings_and_order() {
        let list = SmartCmServerList::new();
        list.replace_list([record(1, ProtocolTypes::TCP), record(2, ProtocolTypes::TCP)]);
        list.mark(&Endpoint::new("127.0.0.1", 2), ProtocolTypes::TCP, ServerQuality::Good)
            .unwrap();

        list.replace_list([
            record(3, ProtocolTypes::TCP),
            record(2, ProtocolTypes::TCP),
            record(3, ProtocolTypes::TCP),
        ]);

        assert_eq!(
            list.weightings(),
            vec![
                (record(3, ProtocolTypes::TCP), BASE_WEIGHTING),
                (record(2, ProtocolTypes::TCP), GOOD_WEIGHTING),
            ]
        );
    }

    #[test]
    fn test_reset_bad_servers() {
        let list = SmartCmServerList::new();
        list.replace_list([record(1, ProtocolTypes::TCP), record(2, ProtocolTypes::TCP)]);
        list.mark(&Endpoint::new("127.0.0.1", 1), ProtocolTypes::TCP, ServerQuality::Bad)
            .unwrap();
        list.mark(&Endpoint::new("127.0.0.1", 2), ProtocolTypes::TCP, ServerQuality::Good)
            .unwrap();

        list.reset_bad_servers();
        let weights: Vec<u32> = list.weightings().into_iter().map(|(_, w)| w).collect();
        assert_eq!(weights, vec![BASE_WEIGHTING, GOOD_WEIGHTING]);
    }

    #[test]
    fn test_marks_decay_after_validity() {
        let clock = ManualClock::new();
        let list = SmartCmServerList::with_clock(ServerListConfig::default(), Arc::new(clock.clone()))
            .unwrap();
        list.replace_list([record(1, ProtocolTypes::TCP)]);
        list.mark(&Endpoint::new("127.0.0.1", 1), ProtocolTypes::TCP, ServerQuality::Bad)
            .unwrap();

        clock.advance(Duration::from_secs(299));
        let _ = list.next_server_candidate(ProtocolTypes::TCP);
        assert_eq!(list.weightings()[0].1, BAD_WEIGHTING);

        clock.advance(Duration::from_secs(2));
        let _ = list.next_server_candidate(ProtocolTypes::TCP);
        assert_eq!(list.weightings()[0].1, BASE_WEIGHTING);
    }

    #[test]
    fn test_weighted_frequencies() {
        let list = SmartCmServerList::new();
        list.replace_list([
            record(1, ProtocolTypes::TCP),
            record(2, ProtocolTypes::TCP),
            record(3, ProtocolTypes::TCP),
        ]);
        list.mark(&Endpoint::new("127.0.0.1", 1), ProtocolTypes::TCP, ServerQuality::Good)
            .unwrap();
        list.mark(&Endpoint::new("127.0.0.1", 2), ProtocolTypes::TCP, ServerQuality::Bad)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let draws = 41_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            let pick = list
                .next_server_candidate_with(ProtocolTypes::TCP, &mut rng)
                .unwrap();
            counts[usize::from(pick.endpoint().port()) - 1] += 1;
        }

        let expected = [30.0 / 41.0, 1.0 / 41.0, 10.0 / 41.0];
        for (count, expected) in counts.iter().zip(expected) {
            let observed = *count as f64 / f64::from(draws);
            assert!(
                (observed - expected).abs() < 0.02,
                "observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_weightings_must_be_strictly_ordered() {
        assert!(ServerListConfig::default().validate().is_ok());

        let equal = ServerListConfig {
            base_weighting: 30,
            ..ServerListConfig::default()
        };
        assert!(matches!(
            SmartCmServerList::with_config(equal),
            Err(ServerListError::InvalidWeightings {
                bad: 1,
                base: 30,
                good: 30
            })
        ));

        let zero = ServerListConfig {
            good_weighting: 0,
            base_weighting: 0,
            bad_weighting: 0,
            ..ServerListConfig::default()
        };
        assert!(SmartCmServerList::with_config(zero).is_err());

        let custom = ServerListConfig {
            good_weighting: 100,
            base_weighting: 20,
            bad_weighting: 2,
            ..ServerListConfig::default()
        };
        assert!(SmartCmServerList::with_config(custom).is_ok());
    }
}
