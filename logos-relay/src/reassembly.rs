//! Fragment reassembly: detects, exactly once, that a logical message is whole.
//!
//! ```text
//! fragment ──► validate ──► put ──► expected count? ──no──► Incomplete
//!                                        │ yes
//!                                        ▼
//!                              count(data) == expected? ──no──► Incomplete
//!                                        │ yes
//!                                        ▼
//!                              claim_completion (CAS) ──lost──► Incomplete
//!                                        │ won
//!                                        ▼
//!                              assemble by seq, delete set
//!                                        │
//!                         payload == "clear"? ──yes──► Cleared (wipe session)
//!                                        │ no
//!                                        ▼
//!                                    Completed
//! ```
//!
//! Arrival order is irrelevant: the metadata fragment may come first, last,
//! or anywhere in between, and duplicates simply overwrite. The claim in the
//! fragment store is what makes completion at-most-once when several
//! submissions observe a full set at the same time.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::RelayError;
use crate::protocol::{Fragment, LogicalMessage, MessageKey};
use crate::storage::{FragmentStore, StoredFragment};

/// Result of submitting one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyOutcome {
    /// More fragments are needed, or another submission already completed it
    Incomplete,
    /// This submission completed the message
    Completed(LogicalMessage),
    /// This submission completed a clear command; the session's fragment sets are gone
    Cleared {
        message: LogicalMessage,
        removed_sets: usize,
    },
}

impl ReassemblyOutcome {
    pub fn is_completion(&self) -> bool {
        !matches!(self, Self::Incomplete)
    }
}

pub struct ReassemblyEngine {
    store: Arc<dyn FragmentStore>,
    clock: Arc<dyn Clock>,
    fragment_ttl_secs: u64,
}

impl ReassemblyEngine {
    pub fn new(store: Arc<dyn FragmentStore>, clock: Arc<dyn Clock>, fragment_ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            fragment_ttl_secs,
        }
    }

    /// Record one fragment and report whether it completed its message.
    pub async fn submit_fragment(&self, fragment: Fragment) -> Result<ReassemblyOutcome, RelayError> {
        fragment.validate()?;

        let Fragment {
            key,
            seq,
            expected_count,
            payload,
        } = fragment;
        let expires_at = self.clock.now_secs() + self.fragment_ttl_secs;

        self.store
            .put(
                &key,
                StoredFragment {
                    seq,
                    expected_count,
                    payload,
                    expires_at,
                },
            )
            .await?;
        log::trace!("Stored fragment {seq} of {key}");

        let expected = match expected_count {
            Some(count) if seq == 0 => count,
            _ => match self.store.get(&key, 0).await? {
                Some(meta) => match meta.expected_count {
                    Some(count) => count,
                    None => return Ok(ReassemblyOutcome::Incomplete),
                },
                None => return Ok(ReassemblyOutcome::Incomplete),
            },
        };

        let have = self.store.count_data(&key).await?;
        if have != expected as usize {
            return Ok(ReassemblyOutcome::Incomplete);
        }

        let fragments = self.store.query_data(&key).await?;
        if fragments.len() != expected as usize {
            return Ok(ReassemblyOutcome::Incomplete);
        }

        if !self.store.claim_completion(&key, expires_at).await? {
            log::debug!("Completion of {key} already claimed");
            return Ok(ReassemblyOutcome::Incomplete);
        }

        // A clear may have wiped the set between the read and the claim
        if expected > 0 {
            match self.store.count_data(&key).await {
                Ok(0) => {
                    log::info!("Discarding completion of {key}: session was cleared");
                    return Ok(ReassemblyOutcome::Incomplete);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Could not re-check fragment set of {key}: {e}"),
            }
        }

        let payload: Vec<u8> = fragments.into_iter().flat_map(|f| f.payload).collect();
        if let Err(e) = self.store.delete_set(&key).await {
            log::error!("Failed to reclaim fragments of {key}, leaving them to expire: {e}");
        }

        let message = LogicalMessage {
            key,
            fragment_count: expected,
            payload,
        };
        log::info!(
            "Completed {} ({} fragments, {} bytes)",
            message.key,
            expected,
            message.payload.len()
        );

        // Claimed: the clear is delivered even if the sweep falls short
        if message.is_clear() {
            let removed_sets = match self.clear_session(&message.key.session_id).await {
                Ok(removed) => removed,
                Err(e) => {
                    log::error!(
                        "Clear of session {} incomplete, leftovers expire by TTL: {e}",
                        message.key.session_id
                    );
                    0
                }
            };
            return Ok(ReassemblyOutcome::Cleared {
                message,
                removed_sets,
            });
        }

        Ok(ReassemblyOutcome::Completed(message))
    }

    /// Delete every in-flight fragment set of a session.
    ///
    /// Keeps going past a failed delete and reports the first failure after
    /// sweeping the rest.
    pub async fn clear_session(&self, session_id: &str) -> Result<usize, RelayError> {
        let keys = self.store.query_by_session(session_id).await?;
        let mut removed = 0;
        let mut failure = None;
        for key in &keys {
            match self.store.delete_set(key).await {
                Ok(_) => removed += 1,
                Err(e) => {
                    log::warn!("Failed to delete fragment set {key}: {e}");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        log::info!("Cleared {removed}/{} fragment sets in session {session_id}", keys.len());
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Number of data fragments currently held for a message.
    pub async fn pending_fragments(&self, key: &MessageKey) -> Result<usize, RelayError> {
        Ok(self.store.count_data(key).await?)
    }
}
