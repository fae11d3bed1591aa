//! Per-call stream windows.
//!
//! Each direction of a streaming call starts with [`INITIAL_WINDOW`] item
//! credits. The sender spends one credit per stream item and waits when it
//! has none. The receiver hands credits back with WINDOW frames as its
//! consumer takes items, so at most [`INITIAL_WINDOW`] items are ever queued
//! for a call.
//!
//! Only stream items count. The command value and the single result of a
//! unary or client-streaming call are sent without credit.

use tokio::sync::Semaphore;

use crate::error::{DispatchError, Result};

/// Stream items a sender may have outstanding on one call.
pub const INITIAL_WINDOW: u32 = 64;

/// Encode a WINDOW increment.
#[inline]
pub fn encode_increment(increment: u32) -> [u8; 4] {
    increment.to_be_bytes()
}

/// Decode a WINDOW payload.
pub fn decode_increment(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| DispatchError::Protocol("WINDOW frame must carry a 4-byte increment".into()))?;
    match u32::from_be_bytes(bytes) {
        0 => Err(DispatchError::Protocol("WINDOW increment must not be 0".into())),
        n => Ok(n),
    }
}

/// Sender side: add `increment` credits unless that would overflow the
/// semaphore. Returns whether the credit was added.
pub(crate) fn add_credit(credit: &Semaphore, increment: u32) -> bool {
    let increment = increment as usize;
    if credit.available_permits().saturating_add(increment) > Semaphore::MAX_PERMITS {
        return false;
    }
    credit.add_permits(increment);
    true
}

/// Credit a sender starts a call with.
pub(crate) fn initial_credit() -> std::sync::Arc<Semaphore> {
    std::sync::Arc::new(Semaphore::new(INITIAL_WINDOW as usize))
}

/// Receiver-side credit accounting.
///
/// Consumed items are returned in batches of half the window, which keeps
/// WINDOW traffic low without letting the sender stall.
#[derive(Debug, Default)]
pub struct WindowGrant {
    consumed: u32,
}

impl WindowGrant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one consumed item; returns the increment to send, if due.
    pub fn consume(&mut self) -> Option<u32> {
        self.consumed += 1;
        if self.consumed >= INITIAL_WINDOW / 2 {
            Some(std::mem::take(&mut self.consumed))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grants_in_half_window_batches() {
        let mut grant = WindowGrant::new();
        let grants: Vec<u32> = (0..INITIAL_WINDOW * 2).filter_map(|_| grant.consume()).collect();
        assert_eq!(grants, vec![INITIAL_WINDOW / 2; 4]);
    }

    #[test]
    fn test_credit_is_capped() {
        let credit = initial_credit();
        assert!(add_credit(&credit, 32));
        assert_eq!(credit.available_permits(), INITIAL_WINDOW as usize + 32);

        let nearly_full = Semaphore::new(Semaphore::MAX_PERMITS - 1);
        assert!(!add_credit(&nearly_full, 2));
        assert_eq!(nearly_full.available_permits(), Semaphore::MAX_PERMITS - 1);
    }

    #[test]
    fn test_increment_payload() {
        assert_eq!(decode_increment(&encode_increment(32)).unwrap(), 32);
        assert!(decode_increment(&encode_increment(0)).is_err());
        assert!(decode_increment(&[0, 1]).is_err());
    }
}
