//! Single slot holding the most recent camera frame.
//!
//! The capture side overwrites the slot at its own pace; the control loop takes whatever is
//! newest without waiting. Frames the loop was too slow to see are dropped, and a frame older
//! than one already taken is never handed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A frame with its capture order and capture time (seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    pub sequence: u64,
    pub timestamp: f64,
    pub image: T,
}

struct Slot<T> {
    latest: Mutex<Option<Frame<T>>>,
    closed: AtomicBool,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, Option<Frame<T>>> {
        // A panic while holding the lock cannot leave a frame half written.
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The one producer of frames.
pub struct FrameWriter<T> {
    slot: Arc<Slot<T>>,
    sequence: u64,
}

/// The one consumer of frames.
pub struct FrameReader<T> {
    slot: Arc<Slot<T>>,
    last_sequence: Option<u64>,
}

/// Creates the two ends of a frame slot. Neither end can be cloned.
pub fn latest_frame_channel<T>() -> (FrameWriter<T>, FrameReader<T>) {
    let slot = Arc::new(Slot {
        latest: Mutex::new(None),
        closed: AtomicBool::new(false),
    });
    (
        FrameWriter {
            slot: slot.clone(),
            sequence: 0,
        },
        FrameReader {
            slot,
            last_sequence: None,
        },
    )
}

impl<T> FrameWriter<T> {
    /// Replaces whatever frame is waiting. Returns the sequence number given to the frame.
    pub fn publish(&mut self, timestamp: f64, image: T) -> u64 {
        self.sequence += 1;
        let frame = Frame {
            sequence: self.sequence,
            timestamp,
            image,
        };
        *self.slot.lock() = Some(frame);
        self.sequence
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.sequence
    }
}

impl<T> Drop for FrameWriter<T> {
    fn drop(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
    }
}

impl<T> FrameReader<T> {
    /// The newest frame not yet taken, if any. Never waits for the producer.
    pub fn take_latest(&mut self) -> Option<Frame<T>> {
        let frame = self.slot.lock().take()?;
        if self.last_sequence.is_some_and(|last| frame.sequence <= last) {
            return None;
        }
        self.last_sequence = Some(frame.sequence);
        Some(frame)
    }

    /// Sequence number of the last frame taken.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// True once the writer is gone. A frame published just before may still be waiting.
    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_slot_does_not_block() {
        let (_writer, mut reader) = latest_frame_channel::<u32>();
        assert!(reader.take_latest().is_none());
        assert!(!reader.is_closed());
    }

    #[test]
    fn test_newest_frame_wins() {
        let (mut writer, mut reader) = latest_frame_channel();
        writer.publish(0.0, "first");
        writer.publish(0.033, "second");
        let frame = reader.take_latest().unwrap();
        assert_eq!(frame.image, "second");
        assert_eq!(frame.sequence, 2);
        // Taken frames are not handed out twice.
        assert!(reader.take_latest().is_none());

        writer.publish(0.066, "third");
        assert_eq!(reader.take_latest().unwrap().sequence, 3);
    }

    #[test]
    fn test_frames_from_another_thread_arrive_in_order() {
        let (mut writer, mut reader) = latest_frame_channel();
        let producer = thread::spawn(move || {
            for i in 0..1000u32 {
                writer.publish(i as f64, i);
            }
        });

        let mut seen = Vec::new();
        while !reader.is_closed() {
            if let Some(frame) = reader.take_latest() {
                seen.push(frame.sequence);
            }
        }
        producer.join().unwrap();
        if let Some(frame) = reader.take_latest() {
            seen.push(frame.sequence);
        }

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&1000));
    }
}
