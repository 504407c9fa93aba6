//! Asynchronous readback of scatter results.
//!
//! Each dispatch registers one [`Readback`] tracking a two-phase copy:
//! the small progress counter first, then the full result buffer at the
//! size the progress read reported. Phases advance strictly
//! progress-then-result, and a readback leaves the manager only once its
//! decoded records have been handed out. Polling is budgeted per frame so
//! a backlog never stalls one frame on GPU synchronization for all
//! outstanding work.

use log::{debug, trace};

use crate::builder::BuilderOutput;
use crate::core::config::ScatterConfig;
use crate::gpu::dispatch::{ProgressInfo, ScatterBuffers};
use crate::gpu::{BufferHandle, ReadbackTicket, ScatterDriver};
use crate::instance::{self, PlacementRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackPhase {
    AwaitingProgress,
    AwaitingResult,
}

/// One in-flight readback. Holds its own references to the cell's
/// progress and result buffers; each is dropped as soon as its phase
/// finishes with it.
#[derive(Debug)]
pub struct Readback {
    pub output: BuilderOutput,
    pub phase: ReadbackPhase,
    /// Result record count learned from the progress read.
    pub next_buffer_size: u32,
    pub max_instances: u32,
    /// Readback-thread frame of the last enqueued copy; polls are held
    /// off for `readback_delay_frames` after it.
    pub last_used_frame: u32,
    progress_buffer: Option<BufferHandle>,
    result_buffer: Option<BufferHandle>,
    ticket: Option<ReadbackTicket>,
}

impl Readback {
    /// Register a readback for a just-submitted dispatch, enqueueing the
    /// progress-phase copy immediately.
    pub fn new(
        output: BuilderOutput,
        buffers: &ScatterBuffers,
        max_instances: u32,
        driver: &dyn ScatterDriver,
        frame: u32,
    ) -> Self {
        let ticket = driver.enqueue_copy(&buffers.progress);
        Self {
            output,
            phase: ReadbackPhase::AwaitingProgress,
            next_buffer_size: 0,
            max_instances,
            last_used_frame: frame,
            progress_buffer: Some(buffers.progress.clone()),
            result_buffer: Some(buffers.result.clone()),
            ticket: Some(ticket),
        }
    }

    fn touch(&mut self, frame: u32) {
        self.last_used_frame = frame;
    }
}

/// Owns every in-flight readback and drives them from the
/// render-submission context.
#[derive(Debug, Default)]
pub struct ReadbackManager {
    list: Vec<Readback>,
}

impl ReadbackManager {
    pub fn add(&mut self, readback: Readback) {
        self.list.push(readback);
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Drop all in-flight readbacks, releasing their buffer references.
    /// Abandoned GPU copies run to completion and are never consumed.
    pub fn clear_all(&mut self) {
        self.list.clear();
    }

    fn poll_window(len: usize, max_per_frame: i32) -> usize {
        let max = max_per_frame.max(1) as usize;
        if len > max { (len / max).max(1) } else { len }
    }

    /// Poll a budgeted slice of outstanding readbacks. Completed ones are
    /// removed and their decoded outputs returned; order between
    /// readbacks is not guaranteed.
    pub fn poll(
        &mut self,
        driver: &dyn ScatterDriver,
        frame: u32,
        config: &ScatterConfig,
    ) -> Vec<BuilderOutput> {
        let mut completed = Vec::new();
        if self.list.is_empty() {
            return completed;
        }

        let mut window = Self::poll_window(self.list.len(), config.max_readbacks_per_frame);
        let mut index = 0;
        while index < window.min(self.list.len()) {
            let readback = &mut self.list[index];
            if readback.last_used_frame + config.readback_delay_frames > frame {
                index += 1;
                continue;
            }
            let Some(ticket) = readback.ticket else {
                // Desynchronized record; skip it this frame.
                index += 1;
                continue;
            };

            match readback.phase {
                ReadbackPhase::AwaitingProgress => {
                    let Some(bytes) =
                        driver.poll_copy(ticket, std::mem::size_of::<ProgressInfo>())
                    else {
                        readback.touch(frame);
                        index += 1;
                        continue;
                    };
                    if bytes.len() < std::mem::size_of::<ProgressInfo>() {
                        // Short read; retry with a fresh copy.
                        let buffer = readback.progress_buffer.as_ref().unwrap();
                        readback.ticket = Some(driver.enqueue_copy(buffer));
                        readback.touch(frame);
                        index += 1;
                        continue;
                    }
                    let progress: ProgressInfo = bytemuck::pod_read_unaligned(
                        &bytes[..std::mem::size_of::<ProgressInfo>()],
                    );
                    if progress.count >= progress.max_instances {
                        trace!(
                            "readback progress complete: {}/{}",
                            progress.count, progress.max_instances
                        );
                        readback.next_buffer_size = progress.max_instances;
                        readback.phase = ReadbackPhase::AwaitingResult;
                        readback.progress_buffer = None;
                        let result = readback.result_buffer.as_ref().unwrap();
                        readback.ticket = Some(driver.enqueue_copy(result));
                    } else {
                        // Compute pass still filling the buffer; watch the
                        // counter again next window.
                        trace!(
                            "readback progress {}/{}, repolling",
                            progress.count, progress.max_instances
                        );
                        let buffer = readback.progress_buffer.as_ref().unwrap();
                        readback.ticket = Some(driver.enqueue_copy(buffer));
                    }
                    readback.touch(frame);
                    index += 1;
                }
                ReadbackPhase::AwaitingResult => {
                    let wanted =
                        readback.next_buffer_size as usize * std::mem::size_of::<PlacementRecord>();
                    let Some(bytes) = driver.poll_copy(ticket, wanted) else {
                        readback.touch(frame);
                        index += 1;
                        continue;
                    };
                    let record_size = std::mem::size_of::<PlacementRecord>();
                    let mut records: Vec<PlacementRecord> = bytes
                        .chunks_exact(record_size)
                        .map(bytemuck::pod_read_unaligned)
                        .collect();
                    let raw = records.len();
                    instance::retain_valid(&mut records);
                    debug!(
                        "readback complete: {} records ({} filtered)",
                        records.len(),
                        raw - records.len()
                    );

                    let mut readback = self.list.swap_remove(index);
                    readback.result_buffer = None;
                    readback.output.records = records;
                    completed.push(readback.output);
                    window = Self::poll_window(self.list.len(), config.max_readbacks_per_frame);
                }
            }
        }
        completed
    }
}
