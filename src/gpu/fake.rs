//! In-memory scatter driver.
//!
//! Stands in for the host render backend when none is attached: buffers
//! are byte vectors, dispatches synthesize a deterministic result set,
//! and copies complete after a configurable number of polls. Used by the
//! crate's own tests and useful for exercising the pipeline headless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::gpu::dispatch::{ProgressInfo, ScatterDispatch, ScatterInput};
use crate::gpu::{BufferHandle, BufferId, GpuBuffer, ReadbackTicket, ScatterDriver};
use crate::instance::PlacementRecord;

struct PendingCopy {
    buffer: BufferId,
    polls_left: u32,
}

#[derive(Default)]
struct FakeState {
    next_buffer: u64,
    next_ticket: u64,
    live: Vec<Weak<GpuBuffer>>,
    contents: HashMap<BufferId, Vec<u8>>,
    copies: HashMap<u64, PendingCopy>,
    dispatch_count: usize,
    dispatch_inputs: Vec<ScatterInput>,
    copy_latency: u32,
    /// When set, dispatches report `max_instances - shortfall` in the
    /// progress counter, simulating an incomplete compute pass.
    progress_shortfall: u32,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies become ready only after `latency` polls.
    pub fn set_copy_latency(&self, latency: u32) {
        self.state.lock().unwrap().copy_latency = latency;
    }

    pub fn set_progress_shortfall(&self, shortfall: u32) {
        self.state.lock().unwrap().progress_shortfall = shortfall;
    }

    pub fn dispatch_count(&self) -> usize {
        self.state.lock().unwrap().dispatch_count
    }

    /// Inputs of every dispatch submitted so far, in submission order.
    pub fn dispatch_inputs(&self) -> Vec<ScatterInput> {
        self.state.lock().unwrap().dispatch_inputs.clone()
    }

    /// Count of allocations still held somewhere.
    pub fn live_buffers(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.live.retain(|w| w.strong_count() > 0);
        let live: Vec<BufferId> = state
            .live
            .iter()
            .filter_map(|w| w.upgrade().map(|b| b.id))
            .collect();
        state.contents.retain(|id, _| live.contains(id));
        state.live.len()
    }

    /// Overwrite a buffer's bytes, for scripting specific readbacks.
    pub fn write_buffer(&self, buffer: &BufferHandle, bytes: Vec<u8>) {
        self.state.lock().unwrap().contents.insert(buffer.id, bytes);
    }

    fn synthesize_records(seed: i32, max_instances: u32) -> Vec<PlacementRecord> {
        (0..max_instances)
            .map(|i| PlacementRecord {
                position: [
                    (i % 64) as f32 * 10.0,
                    (i / 64) as f32 * 10.0,
                    (seed % 1000) as f32,
                ],
                normal: [0.0, 0.0, 1.0],
                scale_seed: (i as f32 * 0.37 + seed as f32 * 0.11).fract().abs(),
            })
            .collect()
    }
}

impl ScatterDriver for FakeDriver {
    fn create_buffer(&self, label: &str, size: u64) -> BufferHandle {
        let mut state = self.state.lock().unwrap();
        let id = BufferId(state.next_buffer);
        state.next_buffer += 1;
        let buffer = Arc::new(GpuBuffer {
            id,
            label: label.to_string(),
            size,
        });
        state.live.push(Arc::downgrade(&buffer));
        state.contents.insert(id, vec![0; size as usize]);
        buffer
    }

    fn dispatch(&self, dispatch: &ScatterDispatch) -> crate::core::types::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dispatch_count += 1;
        state.dispatch_inputs.push(dispatch.input);

        let count = dispatch.max_instances.saturating_sub(state.progress_shortfall);
        let progress = ProgressInfo {
            count,
            max_instances: dispatch.max_instances,
        };
        state.contents.insert(
            dispatch.buffers.progress.id,
            bytemuck::bytes_of(&progress).to_vec(),
        );

        let records = Self::synthesize_records(
            dispatch.params.instancing_random_seed,
            dispatch.max_instances,
        );
        state.contents.insert(
            dispatch.buffers.result.id,
            bytemuck::cast_slice(&records).to_vec(),
        );
        Ok(())
    }

    fn enqueue_copy(&self, buffer: &BufferHandle) -> ReadbackTicket {
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let polls_left = state.copy_latency;
        state.copies.insert(
            ticket,
            PendingCopy {
                buffer: buffer.id,
                polls_left,
            },
        );
        ReadbackTicket(ticket)
    }

    fn poll_copy(&self, ticket: ReadbackTicket, max_bytes: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let copy = state.copies.get_mut(&ticket.0)?;
        if copy.polls_left > 0 {
            copy.polls_left -= 1;
            return None;
        }
        let buffer = copy.buffer;
        state.copies.remove(&ticket.0);
        let mut bytes = state.contents.get(&buffer).cloned().unwrap_or_default();
        bytes.truncate(max_bytes);
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_release_on_drop() {
        let driver = FakeDriver::new();
        let a = driver.create_buffer("a", 16);
        let _b = driver.create_buffer("b", 16);
        assert_eq!(driver.live_buffers(), 2);
        drop(a);
        assert_eq!(driver.live_buffers(), 1);
    }

    #[test]
    fn test_copy_latency() {
        let driver = FakeDriver::new();
        driver.set_copy_latency(2);
        let buf = driver.create_buffer("x", 4);
        driver.write_buffer(&buf, vec![1, 2, 3, 4]);
        let ticket = driver.enqueue_copy(&buf);
        assert!(driver.poll_copy(ticket, 4).is_none());
        assert!(driver.poll_copy(ticket, 4).is_none());
        assert_eq!(driver.poll_copy(ticket, 4), Some(vec![1, 2, 3, 4]));
        // Ticket consumed.
        assert!(driver.poll_copy(ticket, 4).is_none());
    }

    #[test]
    fn test_progress_shortfall_simulates_partial_pass() {
        use crate::gpu::dispatch::{
            DispatchVariant, ScatterBuffers, ScatterParams,
        };
        use crate::landscape::TextureHandle;

        let driver = FakeDriver::new();
        driver.set_progress_shortfall(3);
        let buffers = ScatterBuffers::allocate(&driver, "cell", 16);
        let dispatch = ScatterDispatch {
            input: ScatterInput::default(),
            params: ScatterParams::default(),
            variant: DispatchVariant::WithoutWeightmap {
                heightmap: TextureHandle(0),
            },
            buffers: buffers.clone(),
            max_instances: 16,
        };
        driver.dispatch(&dispatch).unwrap();

        let ticket = driver.enqueue_copy(&buffers.progress);
        let bytes = driver.poll_copy(ticket, 8).unwrap();
        let progress: ProgressInfo = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(progress.count, 13);
        assert_eq!(progress.max_instances, 16);
    }

    #[test]
    fn test_poll_truncates_to_request() {
        let driver = FakeDriver::new();
        let buf = driver.create_buffer("x", 8);
        driver.write_buffer(&buf, vec![9; 8]);
        let ticket = driver.enqueue_copy(&buf);
        assert_eq!(driver.poll_copy(ticket, 3), Some(vec![9, 9, 9]));
    }
}
