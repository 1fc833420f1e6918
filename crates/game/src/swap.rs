//! Sync swappers: the only synchronization point between the engine's loops.
//!
//! Each loop reads from one slot and writes to another; the swap exchanges
//! slot indices under a short lock and nothing blocks inside a loop body.
//! Cancellation is cooperative via the shared quit flag, observed at the next
//! swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A triple-buffered exchange cell: the writer publishes into one slot while
/// the reader consumes another, and a third absorbs the handoff so neither
/// side ever waits on the other.
pub struct SyncSwapper<T> {
    slots: [Mutex<T>; 3],
    indices: Mutex<SwapIndices>,
    quit: AtomicBool,
}

#[derive(Clone, Copy)]
struct SwapIndices {
    read: usize,
    write: usize,
    spare: usize,
    fresh: bool,
}

impl<T: Clone> SyncSwapper<T> {
    pub fn new(initial: T) -> Arc<Self> {
        Arc::new(Self {
            slots: [
                Mutex::new(initial.clone()),
                Mutex::new(initial.clone()),
                Mutex::new(initial),
            ],
            indices: Mutex::new(SwapIndices {
                read: 0,
                write: 1,
                spare: 2,
                fresh: false,
            }),
            quit: AtomicBool::new(false),
        })
    }
}

impl<T> SyncSwapper<T> {
    /// Fill the current write slot, then publish it.
    pub fn publish(&self, write: impl FnOnce(&mut T)) {
        let index = self.indices.lock().expect("swapper poisoned").write;
        {
            let mut slot = self.slots[index].lock().expect("swapper poisoned");
            write(&mut slot);
        }
        let mut indices = self.indices.lock().expect("swapper poisoned");
        let SwapIndices { write, spare, .. } = &mut *indices;
        std::mem::swap(write, spare);
        indices.fresh = true;
    }

    /// Read the freshest published slot. Returns what the writer last
    /// published, swapping it in if one arrived since the previous read.
    pub fn read<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        let index = {
            let mut indices = self.indices.lock().expect("swapper poisoned");
            if indices.fresh {
                let SwapIndices { read, spare, .. } = &mut *indices;
                std::mem::swap(read, spare);
                indices.fresh = false;
            }
            indices.read
        };
        let slot = self.slots[index].lock().expect("swapper poisoned");
        read(&slot)
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_sees_latest_publish() {
        let swapper = SyncSwapper::new(0u32);
        swapper.publish(|v| *v = 7);
        assert_eq!(swapper.read(|v| *v), 7);
        swapper.publish(|v| *v = 9);
        swapper.publish(|v| *v = 11);
        assert_eq!(swapper.read(|v| *v), 11);
    }

    #[test]
    fn test_read_without_publish_repeats() {
        let swapper = SyncSwapper::new(5u32);
        assert_eq!(swapper.read(|v| *v), 5);
        assert_eq!(swapper.read(|v| *v), 5);
    }

    #[test]
    fn test_cross_thread_handoff_and_quit() {
        let swapper = SyncSwapper::new(0u64);
        let writer = Arc::clone(&swapper);
        let handle = thread::spawn(move || {
            for tick in 1..=100u64 {
                writer.publish(|v| *v = tick);
            }
            writer.quit();
        });

        let mut last = 0;
        while !swapper.should_quit() {
            let seen = swapper.read(|v| *v);
            assert!(seen >= last, "reader went backwards: {seen} < {last}");
            last = seen;
        }
        handle.join().unwrap();
        assert_eq!(swapper.read(|v| *v), 100);
    }
}
