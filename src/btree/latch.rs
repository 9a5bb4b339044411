use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const XCL: u32 = 1;
const PEND: u32 = 2;
const SHARE: u32 = 4; // one reader; the share count lives above the flag bits

/// Reader/writer spin latch with pending-writer fairness.
///
/// A waiting writer sets the pending bit, which blocks new readers so the
/// writer cannot starve. All waiting spins with `yield_now`; nothing ever
/// parks on a kernel primitive.
pub struct SpinLatch {
    state: AtomicU32,
}

impl SpinLatch {
    pub const fn new() -> Self {
        SpinLatch {
            state: AtomicU32::new(0),
        }
    }

    /// Wait until no writer holds or wants the latch, then add one to the
    /// share count.
    pub fn read_lock(&self) {
        loop {
            let prev = self.state.load(Ordering::Relaxed);
            if prev & (XCL | PEND) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        prev,
                        prev + SHARE,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            thread::yield_now();
        }
    }

    /// Wait for readers and any other writer to relinquish. Acquiring
    /// clears the pending bit.
    pub fn write_lock(&self) {
        loop {
            let prev = self.state.load(Ordering::Relaxed);
            if prev & XCL == 0 && prev >> 2 == 0 {
                if self
                    .state
                    .compare_exchange_weak(prev, XCL, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if prev & PEND == 0 {
                let _ = self.state.compare_exchange_weak(
                    prev,
                    prev | PEND,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            thread::yield_now();
        }
    }

    /// Take the write latch iff no reader and no writer held it at the
    /// observation; never blocks. A pending bit left by some other writer
    /// is preserved.
    pub fn try_write(&self) -> bool {
        let prev = self.state.load(Ordering::Relaxed);
        if prev & XCL != 0 || prev >> 2 != 0 {
            return false;
        }
        self.state
            .compare_exchange(prev, prev | XCL, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_write(&self) {
        self.state.fetch_and(!XCL, Ordering::Release);
    }

    pub fn release_read(&self) {
        self.state.fetch_sub(SHARE, Ordering::Release);
    }

    /// True if any mode of the latch is held; diagnostic only.
    pub fn is_locked(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        s & XCL != 0 || s >> 2 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusion() {
        let latch = Arc::new(SpinLatch::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut threads = vec![];
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            threads.push(thread::spawn(move || {
                for _ in 0..1000 {
                    latch.write_lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    latch.release_write();
                }
            }));
        }
        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8000);
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_readers_share() {
        let latch = SpinLatch::new();
        latch.read_lock();
        latch.read_lock();
        assert!(!latch.try_write());
        latch.release_read();
        latch.release_read();
        assert!(latch.try_write());
        latch.release_write();
    }

    #[test]
    fn test_try_write_observes_writer() {
        let latch = SpinLatch::new();
        latch.write_lock();
        assert!(!latch.try_write());
        latch.release_write();
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_writer_blocks_new_readers() {
        let latch = Arc::new(SpinLatch::new());
        latch.read_lock();

        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || {
                latch.write_lock();
                latch.release_write();
            })
        };

        // let the writer register its intent, then drain the reader
        thread::sleep(std::time::Duration::from_millis(10));
        latch.release_read();
        waiter.join().unwrap();
        assert!(!latch.is_locked());
    }
}
