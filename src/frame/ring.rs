//! Bounded frame ring shared between one record producer and one
//! stream consumer.
//!
//! The producer packs records into length-prefixed frames; the consumer
//! drains whole frames only. Back-pressure is blocking: when the ring is
//! full the producer parks in [`FrameRing::wait_for_space`] until the
//! consumer has released enough bytes.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::codec::{self, MAXSIZE_PACK32, MAXSIZE_PACK64};

/// Outer frame type byte identifying the payload family on the APC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    /// Perf attribute / bookkeeping records.
    PerfAttrs = 11,
    /// Raw bytes relayed from an external agent.
    External = 10,
}

/// Bytes reserved at the start of every frame: a little-endian u32 payload
/// length followed by the packed frame type.
pub const MAX_FRAME_HEADER_SIZE: usize = 4 + MAXSIZE_PACK32;

struct RingState {
    buf: Box<[u8]>,
    /// Total bytes released by the consumer.
    head: u64,
    /// Total bytes committed (visible to the consumer).
    commit: u64,
    /// Total bytes written, including the open frame.
    write: u64,
    /// Stream offset of the open frame's length prefix.
    frame_start: Option<u64>,
    producer_alive: bool,
    consumer_alive: bool,
}

impl RingState {
    fn free(&self) -> usize {
        self.buf.len() - (self.write - self.head) as usize
    }

    fn put(&mut self, bytes: &[u8]) {
        let cap = self.buf.len() as u64;
        for &b in bytes {
            self.buf[(self.write % cap) as usize] = b;
            self.write += 1;
        }
    }

    /// Overwrite `len` bytes at an absolute stream offset already reserved.
    fn patch(&mut self, at: u64, bytes: &[u8]) {
        let cap = self.buf.len() as u64;
        for (i, &b) in bytes.iter().enumerate() {
            self.buf[((at + i as u64) % cap) as usize] = b;
        }
    }

    fn get(&self, at: u64, out: &mut [u8]) {
        let cap = self.buf.len() as u64;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.buf[((at + i as u64) % cap) as usize];
        }
    }
}

struct Shared {
    state: Mutex<RingState>,
    space: Condvar,
    data: Condvar,
    capacity: usize,
}

/// Producer handle. Single-threaded writer; records are appended to the
/// currently open frame.
pub struct FrameRing {
    shared: Arc<Shared>,
}

/// Consumer handle. Pops complete frames and releases their bytes back to
/// the producer.
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

/// Create a ring of `capacity` bytes with its consumer endpoint.
pub fn frame_ring(capacity: usize) -> (FrameRing, FrameConsumer) {
    assert!(
        capacity > MAX_FRAME_HEADER_SIZE,
        "ring capacity too small for a frame header"
    );

    let shared = Arc::new(Shared {
        state: Mutex::new(RingState {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            commit: 0,
            write: 0,
            frame_start: None,
            producer_alive: true,
            consumer_alive: true,
        }),
        space: Condvar::new(),
        data: Condvar::new(),
        capacity,
    });

    (
        FrameRing {
            shared: Arc::clone(&shared),
        },
        FrameConsumer { shared },
    )
}

impl FrameRing {
    /// Ring capacity in bytes.
    pub fn size(&self) -> usize {
        self.shared.capacity
    }

    /// Free bytes currently available to the producer.
    pub fn bytes_available(&self) -> usize {
        self.shared.state.lock().free()
    }

    /// Whether a write of `bytes` can ever fit in this ring, regardless of
    /// current fill level. Callers must guard oversize records with this
    /// before blocking in [`wait_for_space`](Self::wait_for_space).
    pub fn supports_write_of_size(&self, bytes: usize) -> bool {
        bytes + MAX_FRAME_HEADER_SIZE <= self.shared.capacity
    }

    /// Block until at least `bytes` are free.
    ///
    /// Never returns when `bytes` exceeds what
    /// [`supports_write_of_size`](Self::supports_write_of_size) allows and
    /// the consumer stays alive.
    pub fn wait_for_space(&self, bytes: usize) {
        let mut state = self.shared.state.lock();
        loop {
            if !state.consumer_alive {
                // Nobody will ever read these bytes; discard to keep the
                // producer making progress.
                state.head = state.write;
                return;
            }
            if state.free() >= bytes {
                return;
            }
            self.shared.space.wait(&mut state);
        }
    }

    /// Open a new frame. Requires [`MAX_FRAME_HEADER_SIZE`] free bytes.
    pub fn begin_frame(&self, frame_type: FrameType) {
        let mut state = self.shared.state.lock();
        assert!(state.frame_start.is_none(), "frame already open");
        assert!(state.free() >= MAX_FRAME_HEADER_SIZE);

        state.frame_start = Some(state.write);
        state.put(&[0u8; 4]); // length placeholder

        let mut scratch = [0u8; MAXSIZE_PACK32];
        let len = codec::pack_i32(frame_type as i32, &mut scratch);
        state.put(&scratch[..len]);
    }

    /// Close the open frame, making it visible to the consumer.
    pub fn end_frame(&self) {
        let mut state = self.shared.state.lock();
        let start = state.frame_start.take().expect("no open frame");

        let payload_len = (state.write - start - 4) as u32;
        state.patch(start, &payload_len.to_le_bytes());
        state.commit = state.write;

        self.shared.data.notify_one();
    }

    /// Append raw bytes to the open frame.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock();
        debug_assert!(state.frame_start.is_some(), "no open frame");
        debug_assert!(state.free() >= bytes.len(), "write overruns reservation");
        state.put(bytes);
    }

    /// Append a packed 32-bit integer to the open frame.
    pub fn pack_i32(&self, value: i32) {
        let mut scratch = [0u8; MAXSIZE_PACK32];
        let len = codec::pack_i32(value, &mut scratch);
        self.write_bytes(&scratch[..len]);
    }

    /// Append a packed 64-bit integer to the open frame.
    pub fn pack_i64(&self, value: i64) {
        let mut scratch = [0u8; MAXSIZE_PACK64];
        let len = codec::pack_i64(value, &mut scratch);
        self.write_bytes(&scratch[..len]);
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.producer_alive = false;
        drop(state);
        self.shared.data.notify_one();
    }
}

impl FrameConsumer {
    /// Pop the next complete frame, blocking until one is committed.
    ///
    /// The returned bytes start with the packed frame type; the length
    /// prefix has been stripped. Returns `None` once the producer is gone
    /// and all committed frames have been drained.
    pub fn read_frame(&self) -> Option<Vec<u8>> {
        let mut state = self.shared.state.lock();
        loop {
            if state.commit > state.head {
                let mut len_bytes = [0u8; 4];
                state.get(state.head, &mut len_bytes);
                let payload_len = u32::from_le_bytes(len_bytes) as usize;

                let mut frame = vec![0u8; payload_len];
                state.get(state.head + 4, &mut frame);
                state.head += 4 + payload_len as u64;

                self.shared.space.notify_one();
                return Some(frame);
            }

            if !state.producer_alive {
                return None;
            }

            self.shared.data.wait(&mut state);
        }
    }

    /// Pop a frame without blocking.
    pub fn try_read_frame(&self) -> Option<Vec<u8>> {
        let state = self.shared.state.lock();
        if state.commit > state.head {
            drop(state);
            self.read_frame()
        } else {
            None
        }
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.consumer_alive = false;
        drop(state);
        self.shared.space.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_single_frame_roundtrip() {
        let (ring, consumer) = frame_ring(256);

        ring.begin_frame(FrameType::PerfAttrs);
        ring.pack_i32(0);
        ring.pack_i32(42);
        ring.pack_i64(-7);
        ring.end_frame();

        let frame = consumer.read_frame().expect("frame committed");

        let (ft, mut at) = codec::unpack_i32(&frame).expect("frame type");
        assert_eq!(ft, FrameType::PerfAttrs as i32);

        for expected in [0i64, 42, -7] {
            let (v, n) = codec::unpack_i64(&frame[at..]).expect("value");
            assert_eq!(v, expected);
            at += n;
        }
        assert_eq!(at, frame.len());
    }

    #[test]
    fn test_fifo_prefix_over_wraparound() {
        // Capacity forces several wraps; consumed frames must replay the
        // emitted sequence exactly.
        let (ring, consumer) = frame_ring(64);

        let writer = thread::spawn(move || {
            for i in 0..200i32 {
                ring.wait_for_space(MAX_FRAME_HEADER_SIZE + MAXSIZE_PACK32);
                ring.begin_frame(FrameType::PerfAttrs);
                ring.pack_i32(i);
                ring.end_frame();
            }
        });

        let mut seen = Vec::new();
        while let Some(frame) = consumer.read_frame() {
            let (_, n) = codec::unpack_i32(&frame).expect("frame type");
            let (v, _) = codec::unpack_i32(&frame[n..]).expect("value");
            seen.push(v);
        }

        writer.join().expect("writer");
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_supports_write_of_size_boundary() {
        let (ring, _consumer) = frame_ring(1024);
        assert!(ring.supports_write_of_size(1024 - MAX_FRAME_HEADER_SIZE));
        assert!(!ring.supports_write_of_size(1024 - MAX_FRAME_HEADER_SIZE + 1));
        assert!(!ring.supports_write_of_size(64 * 1024 * 1024));
    }

    #[test]
    fn test_wait_for_space_blocks_until_consumer_drains() {
        let (ring, consumer) = frame_ring(32);

        // Fill the ring with one committed frame.
        ring.begin_frame(FrameType::PerfAttrs);
        ring.write_bytes(&[0xaa; 16]);
        ring.end_frame();

        let blocked = thread::spawn(move || {
            ring.wait_for_space(20);
            ring.begin_frame(FrameType::PerfAttrs);
            ring.pack_i32(1);
            ring.end_frame();
        });

        // Give the producer a moment to park, then release the frame.
        thread::sleep(Duration::from_millis(50));
        let first = consumer.read_frame().expect("first frame");
        assert_eq!(first.len(), 1 + 16);

        let second = consumer.read_frame().expect("second frame");
        blocked.join().expect("producer");

        let (_, n) = codec::unpack_i32(&second).expect("frame type");
        let (v, _) = codec::unpack_i32(&second[n..]).expect("value");
        assert_eq!(v, 1);
    }

    #[test]
    fn test_read_frame_returns_none_after_producer_drop() {
        let (ring, consumer) = frame_ring(128);
        ring.begin_frame(FrameType::External);
        ring.write_bytes(b"payload");
        ring.end_frame();
        drop(ring);

        assert!(consumer.read_frame().is_some());
        assert!(consumer.read_frame().is_none());
    }

    #[test]
    fn test_wait_for_space_returns_when_consumer_gone() {
        let (ring, consumer) = frame_ring(32);
        drop(consumer);

        // Would deadlock if the consumer's absence were not observed.
        ring.wait_for_space(24);
        ring.begin_frame(FrameType::PerfAttrs);
        ring.write_bytes(&[0u8; 8]);
        ring.end_frame();
    }
}
