//! Writer for the perf-attribute record stream.
//!
//! [`PerfAttrsWriter`] owns the producer side of a [`FrameRing`] and packs
//! typed records into `PerfAttrs` frames. Every marshal operation reserves
//! an upper-bound byte budget first; when the open frame cannot fit it, the
//! frame is closed and a fresh one opened, so records never straddle frame
//! boundaries.

use tracing::warn;

use crate::perf::attr::PerfEventAttr;

use super::codec::{MAXSIZE_PACK32, MAXSIZE_PACK64};
use super::ring::{FrameRing, FrameType, MAX_FRAME_HEADER_SIZE};

/// Record type codes inside a `PerfAttrs` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CodeType {
    Pea = 1,
    Keys = 2,
    Format = 3,
    Maps = 4,
    Comm = 5,
    KeysOld = 6,
    OnlineCpu = 7,
    OfflineCpu = 8,
    Kallsyms = 9,
    Counters = 10,
    HeaderPage = 11,
    HeaderEvent = 12,
}

/// Packs typed records into `PerfAttrs` frames on a bounded ring.
pub struct PerfAttrsWriter {
    ring: FrameRing,
}

impl PerfAttrsWriter {
    /// Wrap a ring, opening the initial `PerfAttrs` frame.
    pub fn new(ring: FrameRing) -> Self {
        // A fresh ring always has room for the header.
        ring.begin_frame(FrameType::PerfAttrs);
        ring.pack_i32(0); // core (ignored)
        Self { ring }
    }

    /// Free bytes currently available in the underlying ring.
    pub fn bytes_available(&self) -> usize {
        self.ring.bytes_available()
    }

    /// Close the open frame and start a new one.
    pub fn flush(&mut self) {
        self.ring.end_frame();

        self.ring
            .wait_for_space(MAX_FRAME_HEADER_SIZE + MAXSIZE_PACK32);
        self.ring.begin_frame(FrameType::PerfAttrs);
        self.ring.pack_i32(0); // core (ignored)
    }

    fn wait_for_space(&mut self, bytes: usize) {
        if self.ring.bytes_available() < bytes {
            self.flush();
        }
        self.ring.wait_for_space(bytes);
    }

    /// Emit one `perf_event_attr` with its capture key.
    pub fn marshal_pea(&mut self, attr: &PerfEventAttr, key: i32) {
        let attr_bytes = attr.as_bytes();
        self.wait_for_space(2 * MAXSIZE_PACK32 + attr_bytes.len());
        self.ring.pack_i32(CodeType::Pea as i32);
        self.ring.write_bytes(attr_bytes);
        self.ring.pack_i32(key);
    }

    /// Emit the kernel-id to capture-key mapping table.
    pub fn marshal_keys(&mut self, ids: &[u64], keys: &[i32]) {
        debug_assert_eq!(ids.len(), keys.len());
        let count = ids.len();

        self.wait_for_space(2 * MAXSIZE_PACK32 + count * (MAXSIZE_PACK32 + MAXSIZE_PACK64));
        self.ring.pack_i32(CodeType::Keys as i32);
        self.ring.pack_i32(count as i32);
        for i in 0..count {
            self.ring.pack_i64(ids[i] as i64);
            self.ring.pack_i32(keys[i]);
        }
    }

    /// Emit the legacy key mapping: keys followed by a raw id block.
    pub fn marshal_keys_old(&mut self, keys: &[i32], buf: &[u8]) {
        self.wait_for_space((2 + keys.len()) * MAXSIZE_PACK32 + buf.len());
        self.ring.pack_i32(CodeType::KeysOld as i32);
        self.ring.pack_i32(keys.len() as i32);
        for &key in keys {
            self.ring.pack_i32(key);
        }
        self.ring.write_bytes(buf);
    }

    /// Emit a tracepoint format descriptor.
    pub fn marshal_format(&mut self, format: &str) {
        self.wait_for_space(MAXSIZE_PACK32 + format.len() + 1);
        self.ring.pack_i32(CodeType::Format as i32);
        self.write_terminated(format);
    }

    /// Emit the contents of a process's maps file.
    ///
    /// Maps larger than the ring are dropped with a warning.
    pub fn marshal_maps(&mut self, pid: i32, tid: i32, maps: &str) {
        let required = 3 * MAXSIZE_PACK32 + maps.len() + 1;
        if !self.ring.supports_write_of_size(required) {
            warn!(
                required,
                ring_size = self.ring.size(),
                pid,
                "proc maps file too large for buffer, ignoring",
            );
            return;
        }

        self.wait_for_space(required);
        self.ring.pack_i32(CodeType::Maps as i32);
        self.ring.pack_i32(pid);
        self.ring.pack_i32(tid);
        self.write_terminated(maps);
    }

    /// Emit a process image/comm naming record.
    pub fn marshal_comm(&mut self, pid: i32, tid: i32, image: &str, comm: &str) {
        self.wait_for_space(3 * MAXSIZE_PACK32 + image.len() + 1 + comm.len() + 1);
        self.ring.pack_i32(CodeType::Comm as i32);
        self.ring.pack_i32(pid);
        self.ring.pack_i32(tid);
        self.write_terminated(image);
        self.write_terminated(comm);
    }

    /// Record a CPU coming online at `time`.
    pub fn online_cpu(&mut self, time: u64, cpu: i32) {
        self.wait_for_space(MAXSIZE_PACK32 + MAXSIZE_PACK64);
        self.ring.pack_i32(CodeType::OnlineCpu as i32);
        self.ring.pack_i64(time as i64);
        self.ring.pack_i32(cpu);
    }

    /// Record a CPU going offline at `time`.
    pub fn offline_cpu(&mut self, time: u64, cpu: i32) {
        self.wait_for_space(MAXSIZE_PACK32 + MAXSIZE_PACK64);
        self.ring.pack_i32(CodeType::OfflineCpu as i32);
        self.ring.pack_i64(time as i64);
        self.ring.pack_i32(cpu);
    }

    /// Emit the kernel symbol table.
    ///
    /// Tables larger than the ring are dropped with a warning.
    pub fn marshal_kallsyms(&mut self, kallsyms: &str) {
        let required = 3 * MAXSIZE_PACK32 + kallsyms.len() + 1;
        if !self.ring.supports_write_of_size(required) {
            warn!(
                required,
                ring_size = self.ring.size(),
                "kallsyms file too large for buffer, ignoring",
            );
            return;
        }

        self.wait_for_space(required);
        self.ring.pack_i32(CodeType::Kallsyms as i32);
        self.write_terminated(kallsyms);
    }

    /// Open a `Counters` record for `count` counter triples.
    ///
    /// Reserves the whole record up front so the follow-up
    /// [`perf_counter`](Self::perf_counter) and
    /// [`perf_counter_footer`](Self::perf_counter_footer) calls never block.
    pub fn perf_counter_header(&mut self, time: u64, count: usize) {
        self.wait_for_space(
            MAXSIZE_PACK32
                + MAXSIZE_PACK64
                + count * (2 * MAXSIZE_PACK32 + MAXSIZE_PACK64)
                + MAXSIZE_PACK32,
        );
        self.ring.pack_i32(CodeType::Counters as i32);
        self.ring.pack_i64(time as i64);
    }

    /// Append one counter triple to an open `Counters` record.
    pub fn perf_counter(&mut self, core: i32, key: i32, value: i64) {
        self.ring.pack_i32(core);
        self.ring.pack_i32(key);
        self.ring.pack_i64(value);
    }

    /// Close an open `Counters` record with the sentinel core.
    pub fn perf_counter_footer(&mut self) {
        self.ring.pack_i32(-1);
    }

    /// Emit the ftrace header_page description.
    pub fn marshal_header_page(&mut self, header_page: &str) {
        self.wait_for_space(MAXSIZE_PACK32 + header_page.len() + 1);
        self.ring.pack_i32(CodeType::HeaderPage as i32);
        self.write_terminated(header_page);
    }

    /// Emit the ftrace header_event description.
    pub fn marshal_header_event(&mut self, header_event: &str) {
        self.wait_for_space(MAXSIZE_PACK32 + header_event.len() + 1);
        self.ring.pack_i32(CodeType::HeaderEvent as i32);
        self.write_terminated(header_event);
    }

    fn write_terminated(&mut self, s: &str) {
        self.ring.write_bytes(s.as_bytes());
        self.ring.write_bytes(&[0]);
    }
}
