// SPDX-License-Identifier: GPL-3.0-only

use super::{fence::SyncFence, frame::FrameError, metadata::MetadataKey};
use crate::{
    backend::render::{ColorGamut, PixelFormat},
    utils::geometry::DamageRects,
};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tiny_skia::Pixmap;
use tracing::trace;

pub const BUFFER_QUEUE_SIZE: usize = 3;

/// Consumer end of a virtual screen, usually an encoder or a capture client.
pub trait ProducerSurface: Send + Sync {
    /// Stays the same for the lifetime of the surface.
    fn unique_id(&self) -> u64;
    fn queue_buffer(&self, buffer: SurfaceBuffer);
}

impl fmt::Debug for dyn ProducerSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSurface")
            .field("unique_id", &self.unique_id())
            .finish()
    }
}

pub type BufferMetadata = HashMap<MetadataKey, Vec<u8>>;

/// A finished frame as handed to the consumer.
#[derive(Debug, Clone)]
pub struct SurfaceBuffer {
    pub seq: u64,
    pub pixmap: Pixmap,
    pub format: PixelFormat,
    pub damage: DamageRects,
    pub metadata: BufferMetadata,
    pub fence: SyncFence,
}

impl SurfaceBuffer {
    pub fn metadata(&self, key: MetadataKey) -> Option<&[u8]> {
        self.metadata.get(&key).map(Vec::as_slice)
    }
}

#[derive(Debug, Default)]
struct BufferSlot {
    /// `None` while the buffer is dequeued.
    pixmap: Option<Pixmap>,
    last_seq: Option<u64>,
}

#[derive(Debug)]
pub struct DequeuedBuffer {
    pub slot: usize,
    pub seq: u64,
    pub age: u32,
    pub pixmap: Pixmap,
}

/// Rendering surface wrapped around a producer, with a small ring of
/// buffers so partially redrawn frames know their buffer age.
#[derive(Debug)]
pub struct VirtualSurface {
    producer: Arc<dyn ProducerSurface>,
    unique_id: u64,
    force_cpu: bool,
    slots: Vec<BufferSlot>,
    size: (u32, u32),
    next_seq: u64,
    color_space: ColorGamut,
}

pub type SharedSurface = Arc<Mutex<VirtualSurface>>;

impl VirtualSurface {
    pub fn new(producer: Arc<dyn ProducerSurface>, force_cpu: bool) -> VirtualSurface {
        VirtualSurface {
            unique_id: producer.unique_id(),
            producer,
            force_cpu,
            slots: (0..BUFFER_QUEUE_SIZE).map(|_| BufferSlot::default()).collect(),
            size: (0, 0),
            next_seq: 0,
            color_space: ColorGamut::Srgb,
        }
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn is_force_cpu(&self) -> bool {
        self.force_cpu
    }

    pub fn color_space(&self) -> ColorGamut {
        self.color_space
    }

    pub fn set_color_space(&mut self, color_space: ColorGamut) {
        self.color_space = color_space;
    }

    pub fn dequeue(&mut self, width: u32, height: u32) -> Result<DequeuedBuffer, FrameError> {
        if self.size != (width, height) {
            trace!(width, height, "Reallocating virtual surface buffers");
            self.size = (width, height);
            for slot in self.slots.iter_mut() {
                *slot = BufferSlot::default();
            }
        }

        let seq = self.next_seq;
        let index = (seq % BUFFER_QUEUE_SIZE as u64) as usize;
        let slot = &mut self.slots[index];
        let pixmap = match slot.pixmap.take() {
            Some(pixmap) => pixmap,
            None => {
                slot.last_seq = None;
                Pixmap::new(width, height).ok_or(FrameError::AllocationFailed { width, height })?
            }
        };
        let age = slot
            .last_seq
            .map(|last| (seq - last).min(u32::MAX as u64) as u32)
            .unwrap_or(0);

        Ok(DequeuedBuffer {
            slot: index,
            seq,
            age,
            pixmap,
        })
    }

    /// Hands a drawn buffer to the producer and keeps a copy for later partial redraws.
    pub fn queue(
        &mut self,
        slot: usize,
        seq: u64,
        pixmap: Pixmap,
        format: PixelFormat,
        damage: DamageRects,
        metadata: BufferMetadata,
        fence: SyncFence,
    ) {
        if (pixmap.width(), pixmap.height()) == self.size {
            if let Some(slot) = self.slots.get_mut(slot) {
                slot.pixmap = Some(pixmap.clone());
                slot.last_seq = Some(seq);
            }
        }
        self.next_seq = self.next_seq.max(seq + 1);
        self.producer.queue_buffer(SurfaceBuffer {
            seq,
            pixmap,
            format,
            damage,
            metadata,
            fence,
        });
    }

    /// Returns a buffer that was not drawn to, leaving its age untouched.
    pub fn release(&mut self, slot: usize, pixmap: Pixmap) {
        if (pixmap.width(), pixmap.height()) != self.size {
            return;
        }
        if let Some(slot) = self.slots.get_mut(slot) {
            slot.pixmap = Some(pixmap);
        }
    }
}
