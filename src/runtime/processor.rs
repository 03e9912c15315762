//! The real-time side of a [`Runtime`](super::Runtime).
//!
//! A compile pass publishes an [`Instance`] (program plus storage) through an
//! `ArcSwapOption`. The consumer loads it without blocking, locks the storage
//! (uncontended except while the controlling thread migrates, snapshots or
//! inspects it) and runs `generate` once per sample. An instance is retired
//! inside the same critical section its successor is published in, so a
//! consumer that acquires the lock of a retired instance simply loads again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use arrayvec::ArrayVec;
use parking_lot::Mutex;

use super::jit::Program;
use super::storage::StorageBlock;
use crate::codegen::ir::Method;
use crate::codegen::layout::StructLayout;
use crate::codegen::midi::{MidiEvent, MidiQueue, MIDI_QUEUE_CAPACITY};

pub(crate) type Shared = Arc<ArcSwapOption<Instance>>;

/// A published program together with the storage it runs on.
pub(crate) struct Instance {
    program: Arc<Program>,
    storage: Mutex<StorageBlock>,
    layout: Arc<StructLayout>,
    retired: AtomicBool,
    /// Main MIDI input slot of the root surface.
    input: Option<u32>,
    /// Main output slot of the root surface.
    output: Option<u32>,
}

impl Instance {
    pub fn new(
        program: Arc<Program>,
        storage: StorageBlock,
        layout: Arc<StructLayout>,
        input: Option<u32>,
        output: Option<u32>,
    ) -> Self {
        Self {
            program,
            storage: Mutex::new(storage),
            layout,
            retired: AtomicBool::new(false),
            input,
            output,
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn storage(&self) -> &Mutex<StorageBlock> {
        &self.storage
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.layout
    }

    /// Marks the instance as superseded. Its storage has been migrated and
    /// must not run again.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Runs generate `out.len()` times, writing the main output. The caller
    /// holds the storage lock.
    fn run(&self, storage: &mut StorageBlock, pending: &mut ArrayVec<MidiEvent, MIDI_QUEUE_CAPACITY>, out: &mut [f32]) {
        let ptr = storage.as_ptr();
        for (i, sample) in out.iter_mut().enumerate() {
            if let Some(input) = self.input {
                // SAFETY: `input` is the offset of a MIDI slot of this layout,
                // 4-aligned inside a block aligned to at least 16.
                let queue = unsafe { &mut *(ptr.add(input as usize) as *mut MidiQueue) };
                if i == 0 {
                    for event in pending.drain(..) {
                        queue.push(event);
                    }
                }
                // SAFETY: the lock is held and the block matches the program.
                unsafe { self.program.call(Method::Generate, ptr) };
                // SAFETY: as above.
                let queue = unsafe { &mut *(ptr.add(input as usize) as *mut MidiQueue) };
                queue.clear();
            } else {
                // SAFETY: the lock is held and the block matches the program.
                unsafe { self.program.call(Method::Generate, ptr) };
            }
            *sample = self
                .output
                .and_then(|output| storage.read_f32(output))
                .unwrap_or(0.0);
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if !self.is_retired() {
            let storage = self.storage.get_mut();
            // SAFETY: the instance is being dropped, nothing else can reach
            // its storage.
            unsafe { self.program.call(Method::Destructor, storage.as_ptr()) };
        }
    }
}

/// Consumer handle for the audio thread. Cheap to create, one per stream.
pub struct Processor {
    shared: Shared,
    pending: ArrayVec<MidiEvent, MIDI_QUEUE_CAPACITY>,
}

impl Processor {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared,
            pending: ArrayVec::new(),
        }
    }

    /// Queues an event for the main MIDI input. It is delivered with the next
    /// sample. Returns false when the queue is full.
    pub fn push_midi(&mut self, event: MidiEvent) -> bool {
        self.pending.try_push(event).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.load().is_some()
    }

    /// One sample of the main output. Silence until the first compile.
    pub fn generate(&mut self) -> f32 {
        let mut sample = [0.0];
        self.process_block(&mut sample);
        sample[0]
    }

    /// Fills `out` with consecutive samples under one storage lock.
    pub fn process_block(&mut self, out: &mut [f32]) {
        loop {
            let guard = self.shared.load();
            let Some(instance) = guard.as_ref() else {
                out.fill(0.0);
                return;
            };
            let mut storage = instance.storage.lock();
            if instance.is_retired() {
                // the successor is already published
                continue;
            }
            instance.run(&mut storage, &mut self.pending, out);
            return;
        }
    }
}
