// SPDX-License-Identifier: GPL-3.0-only

//! Dedicated thread composing every mirror destination once per vsync.

use crate::{
    backend::{
        virtual_screen::{CompositionReport, MirrorCompositor},
        RenderServices,
    },
    state::RenderSnapshot,
    utils::NodeId,
};
use anyhow::{Context, Result};
use calloop::{
    channel::{channel, Channel, Event, Sender},
    EventLoop,
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
pub enum ThreadCommand {
    /// Replaces the parameters used for the following vsyncs.
    SyncParams(Box<RenderSnapshot>),
    Vsync(u64),
    End,
}

/// Count of flushed frames per destination. Capture clients block on it
/// until the next frame of a screen is done.
#[derive(Debug, Default)]
pub struct FrameCompletion {
    frames: Mutex<HashMap<NodeId, u64>>,
    cond: Condvar,
}

impl FrameCompletion {
    pub fn notify(&self, id: NodeId) {
        *self.frames.lock().entry(id).or_default() += 1;
        self.cond.notify_all();
    }

    pub fn frame_count(&self, id: NodeId) -> u64 {
        self.frames.lock().get(&id).copied().unwrap_or(0)
    }

    /// Waits until `id` flushed more than `after` frames. Returns the new count,
    /// or `None` on timeout.
    pub fn wait_for_frame(&self, id: NodeId, after: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        loop {
            let count = frames.get(&id).copied().unwrap_or(0);
            if count > after {
                return Some(count);
            }
            if self.cond.wait_until(&mut frames, deadline).timed_out() {
                let count = frames.get(&id).copied().unwrap_or(0);
                return (count > after).then_some(count);
            }
        }
    }
}

struct RenderThreadState {
    compositor: MirrorCompositor,
    snapshot: Option<Box<RenderSnapshot>>,
    reports: Option<std::sync::mpsc::Sender<(u64, CompositionReport)>>,
}

impl RenderThreadState {
    fn vsync(&mut self, sequence: u64) {
        profiling::scope!("render_thread_vsync");
        let Some(snapshot) = self.snapshot.as_mut() else {
            trace!(sequence, "Vsync without render params");
            return;
        };
        let report = self.compositor.render(snapshot);
        snapshot.consume_frame_flags();
        debug!(
            sequence,
            flushed = report.flushed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Mirror frame done"
        );
        if let Some(reports) = self.reports.as_ref() {
            if reports.send((sequence, report)).is_err() {
                self.reports = None;
            }
        }
    }
}

/// Handle of the render thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct RenderThread {
    thread_command: Sender<ThreadCommand>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<FrameCompletion>,
}

impl RenderThread {
    pub fn spawn(services: RenderServices) -> Result<RenderThread> {
        Self::spawn_with_reports(services, None)
    }

    /// Like [`RenderThread::spawn`], additionally sending the report of every vsync.
    pub fn spawn_with_reports(
        services: RenderServices,
        reports: Option<std::sync::mpsc::Sender<(u64, CompositionReport)>>,
    ) -> Result<RenderThread> {
        let (tx, rx) = channel::<ThreadCommand>();
        let completion = services.completion.clone();
        let handle = std::thread::Builder::new()
            .name("mirror-render".into())
            .spawn(move || {
                if let Err(err) = render_thread(services, rx, reports) {
                    error!("Render thread crashed: {}", err);
                }
            })
            .context("Failed to spawn render thread")?;

        Ok(RenderThread {
            thread_command: tx,
            handle: Some(handle),
            completion,
        })
    }

    pub fn sync_params(&self, snapshot: RenderSnapshot) {
        let _ = self
            .thread_command
            .send(ThreadCommand::SyncParams(Box::new(snapshot)));
    }

    pub fn vsync(&self, sequence: u64) {
        let _ = self.thread_command.send(ThreadCommand::Vsync(sequence));
    }

    pub fn completion(&self) -> &Arc<FrameCompletion> {
        &self.completion
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        let _ = self.thread_command.send(ThreadCommand::End);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Render thread panicked");
            }
        }
    }
}

fn render_thread(
    services: RenderServices,
    thread_receiver: Channel<ThreadCommand>,
    reports: Option<std::sync::mpsc::Sender<(u64, CompositionReport)>>,
) -> Result<()> {
    profiling::register_thread!("Mirror Render Thread");

    let mut event_loop: EventLoop<'static, RenderThreadState> =
        EventLoop::try_new().context("Failed to create render event loop")?;
    let mut state = RenderThreadState {
        compositor: MirrorCompositor::new(services),
        snapshot: None,
        reports,
    };

    let signal = event_loop.get_signal();
    event_loop
        .handle()
        .insert_source(thread_receiver, move |command, _, state| match command {
            Event::Msg(ThreadCommand::SyncParams(snapshot)) => {
                trace!("Render params synced");
                state.snapshot = Some(snapshot);
            }
            Event::Msg(ThreadCommand::Vsync(sequence)) => state.vsync(sequence),
            Event::Closed | Event::Msg(ThreadCommand::End) => {
                signal.stop();
                signal.wakeup();
            }
        })
        .map_err(|insert_error| insert_error.error)
        .context("Failed to listen for events")?;

    event_loop.run(None, &mut state, |_| {}).map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::virtual_screen::{
        engine::test::CountingEngine,
        surface::test::RecordingProducer,
        test::{init_logging, mirror_scene, services},
    };

    #[test]
    fn wait_for_frame_times_out() {
        let completion = FrameCompletion::default();
        assert_eq!(completion.wait_for_frame(1, 0, Duration::from_millis(10)), None);
        completion.notify(1);
        assert_eq!(completion.wait_for_frame(1, 0, Duration::from_millis(10)), Some(1));
        assert_eq!(completion.frame_count(2), 0);
    }

    #[test]
    fn vsync_renders_synced_params() {
        init_logging();
        let recorder = RecordingProducer::new(1);
        let (tx, rx) = std::sync::mpsc::channel();
        let thread =
            RenderThread::spawn_with_reports(services(Arc::new(CountingEngine::default())), Some(tx))
                .unwrap();

        // no params yet, nothing to do
        thread.vsync(0);
        thread.sync_params(mirror_scene(recorder.clone(), (100, 50)));
        thread.vsync(1);
        assert_eq!(
            thread.completion().wait_for_frame(2, 0, Duration::from_secs(5)),
            Some(1)
        );
        let (sequence, report) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(report.flushed, vec![2]);

        // same params again, the mirror source did not change
        thread.vsync(2);
        let (_, report) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.skipped, vec![2]);
        assert_eq!(recorder.count(), 1);
        drop(thread);
    }
}
