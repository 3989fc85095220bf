//! Bounded concurrent processing with an in-order trailing checkpoint.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeMap;
use std::future::Future;

/// Tracks completed items by sequence number and releases the checkpoint
/// of the newest item whose predecessors have all completed.
#[derive(Debug)]
pub struct TrailingCheckpoint<C> {
    completed: BTreeMap<u64, C>,
    next_to_emit: u64,
}

impl<C> Default for TrailingCheckpoint<C> {
    fn default() -> Self {
        Self {
            completed: BTreeMap::new(),
            next_to_emit: 0,
        }
    }
}

impl<C> TrailingCheckpoint<C> {
    /// Record completion of item `seq`. Returns the checkpoint to emit, if
    /// the contiguous done prefix grew.
    pub fn complete(&mut self, seq: u64, checkpoint: C) -> Option<C> {
        self.completed.insert(seq, checkpoint);
        let mut unlocked = None;
        while let Some(checkpoint) = self.completed.remove(&self.next_to_emit) {
            unlocked = Some(checkpoint);
            self.next_to_emit += 1;
        }
        unlocked
    }

    pub fn pending(&self) -> usize {
        self.completed.len()
    }
}

/// Process `source` with at most `degree_of_parallelism` items in flight.
///
/// Items are polled concurrently on the calling task, so the overlap comes
/// from waiting on chunk and state I/O rather than from extra threads.
///
/// `emit_checkpoint` runs on the calling task, in source order, once every
/// item up to and including the one the checkpoint belongs to is done. The
/// first error from an item or from `emit_checkpoint` stops the loop and
/// drops whatever is still in flight.
pub async fn run_with_trailing_checkpoint<T, C, E, P, PFut, K, EF, EFut>(
    source: impl IntoIterator<Item = T>,
    degree_of_parallelism: usize,
    get_checkpoint: K,
    process: P,
    mut emit_checkpoint: EF,
) -> Result<(), E>
where
    K: Fn(&T) -> C,
    P: Fn(T) -> PFut,
    PFut: Future<Output = Result<(), E>>,
    EF: FnMut(C) -> EFut,
    EFut: Future<Output = Result<(), E>>,
{
    let degree_of_parallelism = degree_of_parallelism.max(1);
    let mut source = source.into_iter();
    let mut in_flight = FuturesUnordered::new();
    let mut trailing = TrailingCheckpoint::default();
    let mut next_seq = 0u64;

    loop {
        while in_flight.len() < degree_of_parallelism {
            let Some(item) = source.next() else {
                break;
            };
            let seq = next_seq;
            next_seq += 1;
            let checkpoint = get_checkpoint(&item);
            let work = process(item);
            in_flight.push(async move { work.await.map(|()| (seq, checkpoint)) });
        }

        let Some(result) = in_flight.next().await else {
            return Ok(());
        };
        let (seq, checkpoint) = result?;
        if let Some(checkpoint) = trailing.complete(seq, checkpoint) {
            emit_checkpoint(checkpoint).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_trailing_checkpoint_waits_for_prefix() {
        let mut trailing = TrailingCheckpoint::default();
        assert_eq!(trailing.complete(1, "b"), None);
        assert_eq!(trailing.complete(2, "c"), None);
        assert_eq!(trailing.pending(), 2);
        assert_eq!(trailing.complete(0, "a"), Some("c"));
        assert_eq!(trailing.pending(), 0);
        assert_eq!(trailing.complete(3, "d"), Some("d"));
    }

    #[tokio::test]
    async fn test_checkpoints_emitted_in_order() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        // later items finish first
        let delays = [30u64, 20, 10, 0, 5];

        let sink = emitted.clone();
        run_with_trailing_checkpoint(
            0..delays.len(),
            3,
            |i| *i,
            |i| async move {
                tokio::time::sleep(Duration::from_millis(delays[i])).await;
                Ok::<(), String>(())
            },
            |checkpoint| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(checkpoint);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        let emitted = emitted.lock().clone();
        assert!(emitted.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(emitted.last(), Some(&4));
    }

    #[tokio::test]
    async fn test_items_overlap_up_to_the_degree() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        run_with_trailing_checkpoint(
            0..8,
            3,
            |i| *i,
            |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            },
            |_| async { Ok(()) },
        )
        .await
        .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_stops_loop() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let result = run_with_trailing_checkpoint(
            0..10,
            1,
            |i| *i,
            |i| async move {
                if i == 2 {
                    Err(format!("failed on {i}"))
                } else {
                    Ok(())
                }
            },
            |checkpoint| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(checkpoint);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(result, Err("failed on 2".to_string()));
        assert_eq!(*emitted.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let result = run_with_trailing_checkpoint(
            Vec::<u32>::new(),
            4,
            |i| *i,
            |_| async { Ok::<(), String>(()) },
            |_| async { Err("never emitted".to_string()) },
        )
        .await;
        assert!(result.is_ok());
    }
}
