//! Command lists, submission queues and command list recycling.
//!
//! This module wraps the backend's recordable lists and queues with lifecycle
//! tracking:
//! - [`CommandList`] tracks whether a list is recording, closed, in flight or completed
//! - [`CommandQueue`] submits closed lists and signals or waits on [`Fence`]s
//! - [`CommandListRecycler`] reuses lists (and their allocators) once the GPU is done
//!
//! # Overview
//!
//! A list moves through a fixed cycle:
//!
//! ```text
//! Recording --close--> Closed --submit(frame)--> InFlight(frame)
//!     ^                                               |
//!     +------reset------ Completed <--finish_frame----+
//! ```
//!
//! The recycler owns lists between submission and reuse. A list submitted for
//! frame `F` is only handed out again after `finish_frame(c)` with `c >= F`,
//! so an allocator is never reset while the GPU may still read from it.
//!
//! # Example
//!
//! ```
//! use frameflight_rhi::backend::QueueKind;
//! use frameflight_rhi::command::{CommandListRecycler, CommandListState};
//! use frameflight_rhi::software::SoftwareBackend;
//!
//! # fn main() -> Result<(), frameflight_rhi::RhiError> {
//! let backend = SoftwareBackend::new();
//! let mut recycler = CommandListRecycler::new(QueueKind::Copy, 4);
//!
//! let mut list = recycler.acquire(&backend)?;
//! list.close()?;
//! recycler.submit(1, list)?;
//!
//! assert_eq!(recycler.finish_frame(1), 1);
//! let reused = recycler.acquire(&backend)?;
//! assert_eq!(reused.state(), CommandListState::Recording);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::backend::{GpuCommandList, GpuQueue, QueueKind, RenderBackend, TextureFootprint};
use crate::error::{RhiError, RhiResult};
use crate::fence::Fence;

/// Lifecycle state of a [`CommandList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandListState {
    /// Open for recording
    Recording,
    /// Recording ended; ready to execute
    Closed,
    /// Submitted as part of the given frame
    InFlight(u64),
    /// The GPU finished the list; it may be reset
    Completed,
}

/// A command list plus its allocator, with lifecycle tracking.
pub struct CommandList<B: RenderBackend> {
    raw: B::CommandList,
    kind: QueueKind,
    state: CommandListState,
}

impl<B: RenderBackend> CommandList<B> {
    /// Creates a list in the recording state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate the list.
    pub fn new(backend: &B, kind: QueueKind) -> RhiResult<Self> {
        let raw = backend.create_command_list(kind)?;
        Ok(Self {
            raw,
            kind,
            state: CommandListState::Recording,
        })
    }

    // ===== Recording Control =====

    /// Ends recording.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandListState`] unless the list is recording.
    pub fn close(&mut self) -> RhiResult<()> {
        self.expect_recording()?;
        self.raw.close()?;
        self.state = CommandListState::Closed;
        Ok(())
    }

    /// Resets the list and its allocator and reopens it for recording.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandListState`] while the list is in flight.
    pub fn reset(&mut self) -> RhiResult<()> {
        if let CommandListState::InFlight(_) = self.state {
            return Err(RhiError::InvalidCommandListState {
                expected: "Recording, Closed or Completed",
                actual: self.state,
            });
        }
        self.raw.reset()?;
        self.state = CommandListState::Recording;
        Ok(())
    }

    // ===== Copy Commands =====

    /// Records a copy of `size` bytes from `src` into `dst`.
    pub fn copy_buffer(
        &mut self,
        dst: &B::Resource,
        src: &B::Resource,
        size: u64,
    ) -> RhiResult<()> {
        self.expect_recording()?;
        self.raw.copy_buffer(dst, src, size)
    }

    /// Records a copy from a padded upload buffer into one texture subresource.
    pub fn copy_buffer_to_texture(
        &mut self,
        dst: &B::Resource,
        src: &B::Resource,
        footprint: &TextureFootprint,
    ) -> RhiResult<()> {
        self.expect_recording()?;
        self.raw.copy_buffer_to_texture(dst, src, footprint)
    }

    // ===== State =====

    fn expect_recording(&self) -> RhiResult<()> {
        if self.state != CommandListState::Recording {
            return Err(RhiError::InvalidCommandListState {
                expected: "Recording",
                actual: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn mark_in_flight(&mut self, frame: u64) {
        self.state = CommandListState::InFlight(frame);
    }

    pub(crate) fn mark_completed(&mut self) {
        self.state = CommandListState::Completed;
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    /// Queue type the list was created for.
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Returns true if nothing was recorded since the last reset.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.command_count() == 0
    }

    /// Commands recorded since the last reset.
    #[inline]
    pub fn command_count(&self) -> usize {
        self.raw.command_count()
    }

    /// Backend list.
    #[inline]
    pub fn raw(&self) -> &B::CommandList {
        &self.raw
    }
}

/// A submission queue.
pub struct CommandQueue<B: RenderBackend> {
    raw: B::Queue,
    kind: QueueKind,
}

impl<B: RenderBackend> CommandQueue<B> {
    /// Opens a queue of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend has no such queue.
    pub fn new(backend: &B, kind: QueueKind) -> RhiResult<Self> {
        let raw = backend.create_queue(kind)?;
        debug!("Opened {} queue on {} backend", kind.name(), backend.name());
        Ok(Self { raw, kind })
    }

    /// Submits closed lists for execution, in order.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandListState`] if any list is not closed.
    pub fn execute(&self, lists: &[&CommandList<B>]) -> RhiResult<()> {
        if let Some(open) = lists
            .iter()
            .find(|list| list.state() != CommandListState::Closed)
        {
            return Err(RhiError::InvalidCommandListState {
                expected: "Closed",
                actual: open.state(),
            });
        }
        let raw: Vec<&B::CommandList> = lists.iter().map(|list| list.raw()).collect();
        self.raw.execute(&raw)
    }

    /// Signals `fence` with its current expected value once prior work completes.
    pub fn signal(&self, fence: &Fence<B>) -> RhiResult<()> {
        self.raw.signal(fence.raw(), fence.expected_value())
    }

    /// Makes later submissions wait for `fence`'s current expected value.
    pub fn wait(&self, fence: &Fence<B>) -> RhiResult<()> {
        self.raw.wait(fence.raw(), fence.expected_value())
    }

    /// Queue type.
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Backend queue.
    #[inline]
    pub fn raw(&self) -> &B::Queue {
        &self.raw
    }
}

/// Bounded pool of command lists recycled by frame.
///
/// At most `max_lists` lists are ever created. Lists are created lazily, so a
/// steady-state frame loop settles at `frames_in_flight + 1` lists.
pub struct CommandListRecycler<B: RenderBackend> {
    kind: QueueKind,
    max_lists: usize,
    created: usize,
    in_flight: VecDeque<(u64, CommandList<B>)>,
    completed: Vec<CommandList<B>>,
}

impl<B: RenderBackend> CommandListRecycler<B> {
    /// Creates an empty recycler for lists of `kind`.
    pub fn new(kind: QueueKind, max_lists: usize) -> Self {
        Self {
            kind,
            max_lists,
            created: 0,
            in_flight: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    /// Returns a list ready for recording.
    ///
    /// A completed list is reset and reused when available; otherwise a new
    /// one is created.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PoolExhausted`] once `max_lists` lists exist and
    /// none has completed.
    pub fn acquire(&mut self, backend: &B) -> RhiResult<CommandList<B>> {
        if let Some(mut list) = self.completed.pop() {
            // A list that fails to reset is dropped and stops counting
            // against `max_lists`.
            if let Err(err) = list.reset() {
                self.created -= 1;
                warn!(
                    "Dropping {} command list that failed to reset: {}",
                    self.kind.name(),
                    err
                );
                return Err(err);
            }
            return Ok(list);
        }

        if self.created >= self.max_lists {
            error!(
                "{} command list pool exhausted: {} lists exist, {} in flight",
                self.kind.name(),
                self.created,
                self.in_flight.len()
            );
            return Err(RhiError::PoolExhausted {
                pool: "command list",
                capacity: self.max_lists,
            });
        }

        let list = CommandList::new(backend, self.kind)?;
        self.created += 1;
        debug!(
            "Created {} command list {}/{}",
            self.kind.name(),
            self.created,
            self.max_lists
        );
        Ok(list)
    }

    /// Takes ownership of a submitted list until `frame` completes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandListState`] unless the list is closed.
    pub fn submit(&mut self, frame: u64, mut list: CommandList<B>) -> RhiResult<()> {
        if list.state() != CommandListState::Closed {
            return Err(RhiError::InvalidCommandListState {
                expected: "Closed",
                actual: list.state(),
            });
        }
        list.mark_in_flight(frame);
        self.in_flight.push_back((frame, list));
        Ok(())
    }

    /// Returns a list that was never submitted straight to the reuse pool.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidCommandListState`] for lists in flight.
    pub fn give_back(&mut self, mut list: CommandList<B>) -> RhiResult<()> {
        if let CommandListState::InFlight(_) = list.state() {
            return Err(RhiError::InvalidCommandListState {
                expected: "Recording, Closed or Completed",
                actual: list.state(),
            });
        }
        list.mark_completed();
        self.completed.push(list);
        Ok(())
    }

    /// Moves every list submitted at or before `completed_frame` to the reuse pool.
    ///
    /// Returns the number of lists recycled.
    pub fn finish_frame(&mut self, completed_frame: u64) -> usize {
        let mut recycled = 0;
        while let Some((frame, _)) = self.in_flight.front() {
            if *frame > completed_frame {
                break;
            }
            if let Some((_, mut list)) = self.in_flight.pop_front() {
                list.mark_completed();
                self.completed.push(list);
                recycled += 1;
            }
        }
        recycled
    }

    /// Queue type of the pooled lists.
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Maximum number of lists this recycler creates.
    #[inline]
    pub fn max_lists(&self) -> usize {
        self.max_lists
    }

    /// Lists created so far.
    #[inline]
    pub fn created_count(&self) -> usize {
        self.created
    }

    /// Lists awaiting GPU completion.
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Lists ready for reuse.
    #[inline]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Oldest frame still in flight.
    pub fn oldest_in_flight(&self) -> Option<u64> {
        self.in_flight.front().map(|(frame, _)| *frame)
    }
}
