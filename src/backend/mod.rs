// SPDX-License-Identifier: GPL-3.0-only

use self::virtual_screen::{
    engine::{HdrCast, HdrCastPolicy, RenderEngine, SoftwareEngine},
    fence::FenceTracker,
};
use std::{fmt, sync::Arc};

pub mod render;
pub mod render_thread;
pub mod virtual_screen;
pub mod wired;

pub use self::render_thread::FrameCompletion;

/// Collaborators shared by every destination processor.
#[derive(Clone)]
pub struct RenderServices {
    pub engine: Arc<dyn RenderEngine>,
    pub hdr: Arc<dyn HdrCast>,
    pub fences: FenceTracker,
    pub completion: Arc<FrameCompletion>,
}

impl RenderServices {
    pub fn software() -> RenderServices {
        RenderServices {
            engine: Arc::new(SoftwareEngine),
            hdr: Arc::new(HdrCastPolicy),
            fences: FenceTracker::default(),
            completion: Arc::new(FrameCompletion::default()),
        }
    }
}

impl fmt::Debug for RenderServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderServices")
            .field("fences", &self.fences)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}
