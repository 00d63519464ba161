//! Reusable read buffers in a few fixed size classes.

use parking_lot::Mutex;

const SIZE_CLASSES: [usize; 4] = [4 * 1024, 64 * 1024, 128 * 1024, 1024 * 1024];

/// Idle buffers kept per class; anything returned beyond this is dropped.
const MAX_IDLE_PER_CLASS: usize = 32;

pub struct BufferPool {
    classes: Vec<(usize, Mutex<Vec<Vec<u8>>>)>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: SIZE_CLASSES
                .iter()
                .map(|&size| (size, Mutex::new(Vec::new())))
                .collect(),
        }
    }

    /// Hand out a buffer of exactly `size` bytes, taken from the smallest class that fits.
    /// Requests above the largest class are allocated directly and never pooled.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some((class, idle)) = self.classes.iter().find(|(class, _)| size <= *class) else {
            return vec![0; size];
        };

        let mut buf = idle.lock().pop().unwrap_or_else(|| vec![0; *class]);
        buf.truncate(size);
        buf
    }

    /// Return a buffer obtained from [`get`](Self::get).
    pub fn put(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        let Some((_, idle)) = self.classes.iter().find(|(class, _)| *class == capacity) else {
            return;
        };

        let mut idle = idle.lock();
        if idle.len() < MAX_IDLE_PER_CLASS {
            buf.resize(capacity, 0);
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
