//! Pure consistency reconciliation shared by publisher and subscriber.
//!
//! Given the subscriber's last-applied version and an incoming message, the
//! reconciler decides whether to apply, discard, or resynchronize. It
//! performs no I/O and is deterministic, so every delivery interleaving the
//! transport can produce collapses to the same per-key version sequence.

use crate::object::TwinObject;
use crate::patch::{PatchEngine, PatchError};

/// The reconciler's verdict for one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Accept the message: store the payload and advance to the version
    Apply {
        /// The new cached payload
        payload: Vec<u8>,
        /// The version the payload corresponds to
        version: u64,
    },
    /// Duplicate or out-of-order message; discard without side effects
    Ignore,
    /// A gap or corrupt patch was detected; a fresh full snapshot is needed
    ResyncRequired,
}

/// Decide what to do with an incoming twin message.
///
/// Rules, in order:
/// 1. version ≤ `last_applied` → `Ignore`
/// 2. full snapshot → `Apply`
/// 3. patch whose declared base equals `last_applied` → run the patch
///    engine; `Apply` on success, `ResyncRequired` if the patch is corrupt
/// 4. anything else (base mismatch, missing base, no engine) →
///    `ResyncRequired`
#[must_use]
pub fn reconcile(
    last_applied: u64,
    cached_payload: &[u8],
    incoming: &TwinObject,
    engine: Option<&dyn PatchEngine>,
) -> Reconciliation {
    if incoming.version <= last_applied {
        return Reconciliation::Ignore;
    }

    if !incoming.is_patch {
        return Reconciliation::Apply {
            payload: incoming.payload.clone(),
            version: incoming.version,
        };
    }

    if incoming.base_version != Some(last_applied) {
        tracing::debug!(
            key = %incoming.key,
            last_applied,
            base_version = ?incoming.base_version,
            incoming_version = incoming.version,
            "Patch base does not match last applied version"
        );
        return Reconciliation::ResyncRequired;
    }

    let Some(engine) = engine else {
        return Reconciliation::ResyncRequired;
    };

    match engine.apply(cached_payload, &incoming.payload) {
        Ok(payload) => Reconciliation::Apply {
            payload,
            version: incoming.version,
        },
        Err(PatchError::Corrupt(reason)) => {
            tracing::warn!(key = %incoming.key, reason, "Corrupt patch, resync required");
            Reconciliation::ResyncRequired
        }
        Err(PatchError::Unsupported) => Reconciliation::ResyncRequired,
    }
}
