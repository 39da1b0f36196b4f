use derive_more::{Display, From, Into};
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Instant,
};

/// Strictly increasing ordinal assigned to every emission process-wide.
///
/// For any two deliveries on the same stream, stamp order equals causal
/// order. Stamps are never reused.
#[derive(Copy, Clone, Debug, Default, Display, From, Into, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn incremented(self) -> Self {
        Self(self.0 + 1)
    }
}

static LAST: AtomicU64 = AtomicU64::new(0);
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic clock reading; +1 keeps the very first stamp positive.
fn clock() -> u64 {
    EPOCH.elapsed().as_nanos() as u64 + 1
}

/// Produce a fresh stamp, strictly greater than every stamp handed out
/// before. If the clock has not advanced since the last call, the previous
/// stamp is bumped by 1.
pub fn next_stamp() -> Stamp {
    let now = clock();
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return Stamp(next),
            Err(observed) => prev = observed,
        }
    }
}

thread_local! {
    static AMBIENT: Cell<Option<u64>> = Cell::new(None);
}

/// The stamp of the emission context currently being propagated, if any.
pub fn current_stamp() -> Option<Stamp> {
    AMBIENT.with(|cell| cell.get().map(Stamp))
}

/// The stamp to use for an emission produced right now: the ambient one if
/// an emission context is active, a fresh one otherwise. Operators that
/// re-emit on another stream inherit the upstream stamp this way, so the
/// downstream ordering rules stay valid.
pub fn emission_stamp() -> Stamp {
    current_stamp().unwrap_or_else(next_stamp)
}

struct AmbientGuard {
    prev: Option<u64>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        AMBIENT.with(|cell| cell.set(prev));
    }
}

/// Run `f` with `stamp` as the ambient emission stamp, restoring the
/// previous ambient value on exit, also when `f` panics.
pub fn with_stamp<R>(stamp: Stamp, f: impl FnOnce() -> R) -> R {
    let prev = AMBIENT.with(|cell| cell.replace(Some(stamp.into())));
    let _guard = AmbientGuard { prev };
    f()
}

pin_project! {
    /// Future adapter that installs an ambient stamp around every poll of
    /// the wrapped future, covering its awaited extent.
    #[must_use = "futures do nothing unless polled"]
    pub struct Stamped<F> {
        #[pin]
        fut: F,
        stamp: Stamp,
    }
}

pub fn stamped<F: Future>(stamp: Stamp, fut: F) -> Stamped<F> {
    Stamped { fut, stamp }
}

impl<F: Future> Future for Stamped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let stamp = *this.stamp;
        with_stamp(stamp, || this.fut.poll(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_increasing() {
        let mut prev = next_stamp();
        for _ in 0..10_000 {
            let next = next_stamp();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn stamps_are_unique_across_threads() {
        let handles = (0..4)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| next_stamp()).collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        let mut all = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    #[test]
    fn ambient_stamp_is_scoped_and_restored() {
        assert_eq!(current_stamp(), None);
        let outer = next_stamp();
        with_stamp(outer, || {
            assert_eq!(current_stamp(), Some(outer));
            let inner = next_stamp();
            with_stamp(inner, || assert_eq!(current_stamp(), Some(inner)));
            assert_eq!(current_stamp(), Some(outer));
        });
        assert_eq!(current_stamp(), None);
    }

    #[test]
    fn ambient_stamp_is_restored_on_panic() {
        let stamp = next_stamp();
        let result = std::panic::catch_unwind(|| with_stamp(stamp, || panic!("boom")));
        assert!(result.is_err());
        assert_eq!(current_stamp(), None);
    }

    #[tokio::test]
    async fn stamped_future_covers_awaited_extent() {
        let stamp = next_stamp();
        stamped(stamp, async move {
            assert_eq!(current_stamp(), Some(stamp));
            tokio::task::yield_now().await;
            assert_eq!(current_stamp(), Some(stamp));
        })
        .await;
        assert_eq!(current_stamp(), None);
    }

    quickcheck::quickcheck! {
        fn emission_stamp_prefers_ambient(value: u64) -> bool {
            let stamp = Stamp::new(value);
            with_stamp(stamp, || emission_stamp() == stamp)
        }
    }
}
