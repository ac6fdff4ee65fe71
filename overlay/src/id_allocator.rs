//! Hands out fresh child context IDs, refilling its range by asking the
//! master.

use crate::{
    error::Error,
    message::{Envelope, MessageKind},
};
use std::ops::Range;
use tokio::sync::Mutex;

/// A function that performs the `ALLOCATE_ID` round-trip to the master and
/// returns the next half-open range. The router supplies this so the
/// allocator itself stays transport-agnostic.
pub type RefillFn = Box<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Range<u32>, Error>> + Send>> + Send + Sync>;

/// Thread-safe half-open-range ID allocator.
///
/// At the master, `refill` is never called: the master's range is simply
/// never exhausted in practice because it owns the counter directly
/// (installed via [`IdAllocator::local`]); everywhere else it performs the
/// `ALLOCATE_ID` RPC.
pub struct IdAllocator {
    range: Mutex<Range<u32>>,
    refill: Option<RefillFn>,
}

impl IdAllocator {
    /// An allocator that owns its counter directly, for the master.
    pub fn local(start: u32) -> Self {
        Self {
            range: Mutex::new(start..u32::MAX),
            refill: None,
        }
    }

    /// An allocator that refills via RPC once its initial (empty) range is
    /// exhausted.
    pub fn remote(refill: RefillFn) -> Self {
        Self {
            range: Mutex::new(0..0),
            refill: Some(refill),
        }
    }

    /// Holds the lock across the refill round-trip, so two concurrent
    /// callers observing an empty range never both issue `ALLOCATE_ID`.
    pub async fn allocate(&self) -> Result<u32, Error> {
        let mut range = self.range.lock().await;
        loop {
            if let Some(id) = next(&mut range) {
                return Ok(id);
            }

            match &self.refill {
                Some(refill) => *range = refill().await?,
                None => return Err(Error::Error("id allocator exhausted")),
            }
        }
    }
}

fn next(range: &mut Range<u32>) -> Option<u32> {
    if range.is_empty() {
        None
    } else {
        let id = range.start;
        range.start += 1;
        Some(id)
    }
}

/// Size of the range handed out per `ALLOCATE_ID` reply.
pub const ALLOCATION_CHUNK: u32 = 1000;

/// Encodes a `(start, end)` reply for the `ALLOCATE_ID` RPC.
pub fn encode_allocation(range: &Range<u32>) -> Envelope {
    let payload = bincode::serialize(&(range.start, range.end)).expect("tuple always serialises");
    Envelope::new(MessageKind::AllocateId, 0, 0, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_allocator_yields_distinct_ids() {
        let allocator = IdAllocator::local(1);
        let a = allocator.allocate().await.unwrap();
        let b = allocator.allocate().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_unique() {
        use std::sync::Arc;

        let allocator = Arc::new(IdAllocator::local(1));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move { allocator.allocate().await.unwrap() }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn remote_allocator_refills_when_exhausted() {
        let refill: RefillFn = Box::new(|| Box::pin(async { Ok(100..102) }));
        let allocator = IdAllocator::remote(refill);
        assert_eq!(allocator.allocate().await.unwrap(), 100);
        assert_eq!(allocator.allocate().await.unwrap(), 101);
    }
}
