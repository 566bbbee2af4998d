// Frame loop - API independent part
//
// One frame = resize if needed -> record -> submit + present -> wait for GPU.
// The loop never keeps more than one frame in flight: after presenting it
// blocks until the GPU has signaled the fence value of that frame, so the
// single command list can be reset right away next time.
//
// Everything GPU specific sits behind `FrameBackend`; the Vulkan version
// lives in `backend::renderer`.

pub mod clock;
pub mod fence;
pub mod window_state;

pub use clock::{FpsReport, FrameClock};
pub use fence::FrameFence;
pub use window_state::{aspect_ratio, WindowState};

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use std::sync::Arc;
use std::time::Instant;

/// Binding slot of the texture descriptor table.
pub const TEXTURE_TABLE_SLOT: u32 = 0;
/// Binding slot of the inline frame constants.
pub const CONSTANTS_SLOT: u32 = 1;

/// Payload pushed into the inline-constant slot every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    pub viewport: Vec2,
    pub aspect: f32,
    pub uptime: f32,
}

impl FrameConstants {
    pub fn new(width: u32, height: u32, uptime: f64) -> Self {
        Self {
            viewport: Vec2::new(width as f32, height as f32),
            aspect: aspect_ratio(width, height),
            uptime: uptime as f32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

/// Resources whose state the frame loop moves around explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    VertexBuffer,
    Texture,
    BackBuffer(u32),
}

/// Usage states a resource is transitioned between. The runtime does no
/// implicit transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Owned by the presentation engine (the "common" state of a back buffer).
    Present,
    CopyDest,
    VertexBuffer,
    PixelShaderResource,
    RenderTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Index of the back buffer to render into, as reported by the chain.
    Ready(u32),
    /// The chain no longer matches the surface and must be recreated.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    NeedsResize,
}

/// Commands the frame loop records into its single command list.
pub trait CommandRecorder {
    /// Reset the allocator and the command list.
    fn begin(&mut self) -> Result<()>;
    /// Copy staged vertex and texture bytes into their GPU-local homes.
    fn copy_upload_data(&mut self);
    fn transition(&mut self, resource: Resource, before: ResourceState, after: ResourceState);
    fn bind_pipeline(&mut self);
    fn bind_texture_table(&mut self, slot: u32);
    fn push_constants(&mut self, slot: u32, constants: &FrameConstants);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, rect: ScissorRect);
    /// Bind the back buffer as the color target and clear it.
    fn begin_render_target(&mut self, back_buffer: u32, clear_color: [f32; 4]);
    fn end_render_target(&mut self);
    fn set_topology(&mut self, topology: Topology);
    fn bind_vertex_buffer(&mut self);
    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    /// Close the command list.
    fn end(&mut self) -> Result<()>;
}

/// Swap chain, queue and fence operations the frame loop drives.
pub trait FrameBackend: CommandRecorder {
    /// Recreate the render targets. Returns the extent actually used.
    fn resize(&mut self, width: u32, height: u32) -> Result<(u32, u32)>;
    fn acquire_back_buffer(&mut self) -> Result<Acquired>;
    /// Execute the closed command list.
    fn submit(&mut self) -> Result<()>;
    /// Present the acquired back buffer.
    fn present(&mut self) -> Result<PresentStatus>;
    fn signal(&mut self, value: u64) -> Result<()>;
    fn completed_value(&self) -> Result<u64>;
    /// Block until the fence reaches `value`. No timeout.
    fn wait_for(&mut self, value: u64) -> Result<()>;
}

/// Lifecycle of the uploaded resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Destination resources exist but hold nothing yet. The next command
    /// list carries the upload copies.
    Uninitialized,
    /// Uploads are done.
    SteadyState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// Nothing was submitted (minimized, or the chain went out of date).
    Skipped,
    Rendered(Option<FpsReport>),
}

pub struct FrameLoop<B: FrameBackend> {
    backend: B,
    window: Arc<WindowState>,
    stage: Stage,
    fence: FrameFence,
    clock: FrameClock,
    extent: (u32, u32),
    clear_color: [f32; 4],
    vertex_count: u32,
}

impl<B: FrameBackend> FrameLoop<B> {
    pub fn new(
        backend: B,
        window: Arc<WindowState>,
        clear_color: [f32; 4],
        vertex_count: u32,
        start: Instant,
    ) -> Self {
        let extent = window.size();
        Self {
            backend,
            window,
            stage: Stage::Uninitialized,
            fence: FrameFence::new(),
            clock: FrameClock::new(start),
            extent,
            clear_color,
            vertex_count,
        }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[cfg(test)]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[cfg(test)]
    pub fn fence_value(&self) -> u64 {
        self.fence.current()
    }

    #[cfg(test)]
    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn render_frame(&mut self, now: Instant) -> Result<FrameOutcome> {
        // A zero-sized chain can't exist; keep any resize pending until
        // the window comes back.
        if self.window.is_minimized() {
            return Ok(FrameOutcome::Skipped);
        }

        if let Some((width, height)) = self.window.take_resize() {
            log::debug!("Recreating render targets at {}x{}", width, height);
            self.extent = self
                .backend
                .resize(width, height)
                .context("Failed to resize swap chain")?;
        }

        let back_buffer = match self.backend.acquire_back_buffer()? {
            Acquired::Ready(index) => index,
            Acquired::OutOfDate => {
                self.window.request_resize();
                return Ok(FrameOutcome::Skipped);
            }
        };

        let (width, height) = self.extent;
        let constants = FrameConstants::new(width, height, self.clock.uptime(now));
        self.record(back_buffer, &constants)?;

        self.backend.submit()?;
        if self.backend.present()? == PresentStatus::NeedsResize {
            self.window.request_resize();
        }

        self.wait_for_gpu()?;

        Ok(FrameOutcome::Rendered(self.clock.frame_finished(now)))
    }

    fn record(&mut self, back_buffer: u32, constants: &FrameConstants) -> Result<()> {
        let (width, height) = self.extent;
        let backend = &mut self.backend;

        backend.begin().context("Failed to reset command list")?;

        match self.stage {
            Stage::Uninitialized => {
                record_upload(backend);
                self.stage = Stage::SteadyState;
            }
            Stage::SteadyState => {}
        }

        backend.bind_pipeline();
        backend.bind_texture_table(TEXTURE_TABLE_SLOT);
        backend.push_constants(CONSTANTS_SLOT, constants);

        backend.set_viewport(Viewport::full(width, height));
        backend.set_scissor(ScissorRect::full(width, height));

        let target = Resource::BackBuffer(back_buffer);
        backend.transition(target, ResourceState::Present, ResourceState::RenderTarget);

        backend.begin_render_target(back_buffer, self.clear_color);
        backend.set_topology(Topology::TriangleList);
        backend.bind_vertex_buffer();
        backend.draw(self.vertex_count, 1);
        backend.end_render_target();

        backend.transition(target, ResourceState::RenderTarget, ResourceState::Present);

        backend.end().context("Failed to close command list")
    }

    fn wait_for_gpu(&mut self) -> Result<()> {
        let value = self.fence.next();
        self.backend.signal(value)?;

        if self.backend.completed_value()? < value {
            self.backend.wait_for(value)?;
        }
        Ok(())
    }
}

fn record_upload<R: CommandRecorder>(recorder: &mut R) {
    recorder.copy_upload_data();
    recorder.transition(
        Resource::VertexBuffer,
        ResourceState::CopyDest,
        ResourceState::VertexBuffer,
    );
    recorder.transition(
        Resource::Texture,
        ResourceState::CopyDest,
        ResourceState::PixelShaderResource,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        Begin,
        CopyUpload,
        Transition(Resource, ResourceState, ResourceState),
        BindPipeline,
        BindTextureTable(u32),
        PushConstants(u32, FrameConstants),
        Viewport(Viewport),
        Scissor(ScissorRect),
        BeginRenderTarget(u32, [f32; 4]),
        EndRenderTarget,
        Topology(Topology),
        BindVertexBuffer,
        Draw(u32, u32),
        End,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct FakeTarget {
        width: u32,
        height: u32,
        heap_slot: u64,
    }

    /// Descriptor size of a render-target view in the fake heap.
    const RTV_STRIDE: u64 = 32;

    /// Records commands instead of talking to a GPU. The fake GPU finishes
    /// work only when waited on, unless `instant_gpu` is set.
    #[derive(Default)]
    struct FakeBackend {
        buffer_count: u32,
        render_targets: Vec<FakeTarget>,
        resizes: Vec<(u32, u32)>,
        commands: Vec<Cmd>,
        submitted: Vec<Vec<Cmd>>,
        acquired: u32,
        out_of_date_acquires: u32,
        needs_resize_presents: u32,
        signaled: Vec<u64>,
        completed: u64,
        waits: Vec<u64>,
        instant_gpu: bool,
    }

    impl FakeBackend {
        fn new(buffer_count: u32) -> Self {
            Self {
                buffer_count,
                ..Default::default()
            }
        }

        fn count(&self, pred: impl Fn(&Cmd) -> bool) -> usize {
            self.submitted.iter().flatten().filter(|c| pred(c)).count()
        }
    }

    impl CommandRecorder for FakeBackend {
        fn begin(&mut self) -> Result<()> {
            assert!(self.commands.is_empty(), "command list reset while still open");
            self.commands.push(Cmd::Begin);
            Ok(())
        }
        fn copy_upload_data(&mut self) {
            self.commands.push(Cmd::CopyUpload);
        }
        fn transition(&mut self, resource: Resource, before: ResourceState, after: ResourceState) {
            self.commands.push(Cmd::Transition(resource, before, after));
        }
        fn bind_pipeline(&mut self) {
            self.commands.push(Cmd::BindPipeline);
        }
        fn bind_texture_table(&mut self, slot: u32) {
            self.commands.push(Cmd::BindTextureTable(slot));
        }
        fn push_constants(&mut self, slot: u32, constants: &FrameConstants) {
            self.commands.push(Cmd::PushConstants(slot, *constants));
        }
        fn set_viewport(&mut self, viewport: Viewport) {
            self.commands.push(Cmd::Viewport(viewport));
        }
        fn set_scissor(&mut self, rect: ScissorRect) {
            self.commands.push(Cmd::Scissor(rect));
        }
        fn begin_render_target(&mut self, back_buffer: u32, clear_color: [f32; 4]) {
            assert!((back_buffer as usize) < self.render_targets.len());
            self.commands.push(Cmd::BeginRenderTarget(back_buffer, clear_color));
        }
        fn end_render_target(&mut self) {
            self.commands.push(Cmd::EndRenderTarget);
        }
        fn set_topology(&mut self, topology: Topology) {
            self.commands.push(Cmd::Topology(topology));
        }
        fn bind_vertex_buffer(&mut self) {
            self.commands.push(Cmd::BindVertexBuffer);
        }
        fn draw(&mut self, vertex_count: u32, instance_count: u32) {
            self.commands.push(Cmd::Draw(vertex_count, instance_count));
        }
        fn end(&mut self) -> Result<()> {
            self.commands.push(Cmd::End);
            Ok(())
        }
    }

    impl FrameBackend for FakeBackend {
        fn resize(&mut self, width: u32, height: u32) -> Result<(u32, u32)> {
            // Views go first, then the chain is rebuilt.
            self.render_targets.clear();
            self.resizes.push((width, height));
            self.render_targets = (0..self.buffer_count as u64)
                .map(|i| FakeTarget {
                    width,
                    height,
                    heap_slot: i * RTV_STRIDE,
                })
                .collect();
            Ok((width, height))
        }

        fn acquire_back_buffer(&mut self) -> Result<Acquired> {
            if self.out_of_date_acquires > 0 {
                self.out_of_date_acquires -= 1;
                return Ok(Acquired::OutOfDate);
            }
            let index = self.acquired % self.buffer_count;
            self.acquired += 1;
            Ok(Acquired::Ready(index))
        }

        fn submit(&mut self) -> Result<()> {
            assert_eq!(self.commands.last(), Some(&Cmd::End), "submitted an open list");
            self.submitted.push(std::mem::take(&mut self.commands));
            Ok(())
        }

        fn present(&mut self) -> Result<PresentStatus> {
            if self.needs_resize_presents > 0 {
                self.needs_resize_presents -= 1;
                return Ok(PresentStatus::NeedsResize);
            }
            Ok(PresentStatus::Optimal)
        }

        fn signal(&mut self, value: u64) -> Result<()> {
            self.signaled.push(value);
            if self.instant_gpu {
                self.completed = value;
            }
            Ok(())
        }

        fn completed_value(&self) -> Result<u64> {
            Ok(self.completed)
        }

        fn wait_for(&mut self, value: u64) -> Result<()> {
            self.waits.push(value);
            self.completed = self.completed.max(value);
            Ok(())
        }
    }

    const CLEAR: [f32; 4] = [0.117, 0.117, 0.120, 1.0];

    fn frame_loop(width: u32, height: u32) -> (FrameLoop<FakeBackend>, Arc<WindowState>, Instant) {
        let window = Arc::new(WindowState::new(width, height));
        let start = Instant::now();
        let frames = FrameLoop::new(FakeBackend::new(2), window.clone(), CLEAR, 3, start);
        (frames, window, start)
    }

    fn constants_of(list: &[Cmd]) -> FrameConstants {
        list.iter()
            .find_map(|c| match c {
                Cmd::PushConstants(CONSTANTS_SLOT, constants) => Some(*constants),
                _ => None,
            })
            .expect("frame constants pushed")
    }

    #[test]
    fn first_frame_creates_render_targets() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        assert_eq!(frames.render_frame(start).unwrap(), FrameOutcome::Rendered(None));

        let backend = frames.backend();
        assert_eq!(backend.resizes, vec![(720, 480)]);
        assert_eq!(backend.render_targets.len(), 2);
    }

    #[test]
    fn upload_runs_exactly_once() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        assert_eq!(frames.stage(), Stage::Uninitialized);

        for i in 0..10 {
            frames.render_frame(start + Duration::from_millis(16 * i)).unwrap();
            assert_eq!(frames.stage(), Stage::SteadyState);
        }

        let backend = frames.backend();
        assert_eq!(backend.count(|c| *c == Cmd::CopyUpload), 1);

        let first = &backend.submitted[0];
        let copy = first.iter().position(|c| *c == Cmd::CopyUpload).unwrap();
        assert_eq!(
            &first[copy + 1..copy + 3],
            &[
                Cmd::Transition(Resource::VertexBuffer, ResourceState::CopyDest, ResourceState::VertexBuffer),
                Cmd::Transition(Resource::Texture, ResourceState::CopyDest, ResourceState::PixelShaderResource),
            ]
        );
        assert!(backend.submitted[1..]
            .iter()
            .all(|list| !list.contains(&Cmd::CopyUpload)));
    }

    #[test]
    fn upload_happens_once_even_for_a_single_frame() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        frames.render_frame(start).unwrap();
        assert_eq!(frames.backend().count(|c| *c == Cmd::CopyUpload), 1);
    }

    #[test]
    fn fence_advances_by_one_per_frame() {
        let (mut frames, _window, start) = frame_loop(720, 480);

        for k in 1..=5u64 {
            frames.render_frame(start).unwrap();
            assert_eq!(frames.fence_value(), k);
            assert!(frames.backend().completed_value().unwrap() >= k);
        }

        let backend = frames.backend();
        assert_eq!(backend.signaled, vec![1, 2, 3, 4, 5]);
        // The fake GPU lags, so every frame blocked on its own value.
        assert_eq!(backend.waits, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn no_wait_when_gpu_already_finished() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        frames.backend_mut().instant_gpu = true;
        for _ in 0..3 {
            frames.render_frame(start).unwrap();
        }
        assert!(frames.backend().waits.is_empty());
        assert_eq!(frames.backend().signaled, vec![1, 2, 3]);
    }

    #[test]
    fn single_triangle_draw_per_frame() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        for _ in 0..3 {
            frames.render_frame(start).unwrap();
        }

        for list in &frames.backend().submitted {
            let draws: Vec<_> = list.iter().filter(|c| matches!(c, Cmd::Draw(..))).collect();
            assert_eq!(draws, vec![&Cmd::Draw(3, 1)]);

            let draw = list.iter().position(|c| matches!(c, Cmd::Draw(..))).unwrap();
            let topology = list.iter().position(|c| *c == Cmd::Topology(Topology::TriangleList)).unwrap();
            let vertices = list.iter().position(|c| *c == Cmd::BindVertexBuffer).unwrap();
            assert!(topology < draw && vertices < draw);
        }
    }

    #[test]
    fn frame_command_order() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        frames.render_frame(start).unwrap();
        frames.render_frame(start).unwrap();

        let list = &frames.backend().submitted[1];
        let constants = constants_of(list);
        assert_eq!(
            list,
            &vec![
                Cmd::Begin,
                Cmd::BindPipeline,
                Cmd::BindTextureTable(TEXTURE_TABLE_SLOT),
                Cmd::PushConstants(CONSTANTS_SLOT, constants),
                Cmd::Viewport(Viewport::full(720, 480)),
                Cmd::Scissor(ScissorRect::full(720, 480)),
                Cmd::Transition(Resource::BackBuffer(1), ResourceState::Present, ResourceState::RenderTarget),
                Cmd::BeginRenderTarget(1, CLEAR),
                Cmd::Topology(Topology::TriangleList),
                Cmd::BindVertexBuffer,
                Cmd::Draw(3, 1),
                Cmd::EndRenderTarget,
                Cmd::Transition(Resource::BackBuffer(1), ResourceState::RenderTarget, ResourceState::Present),
                Cmd::End,
            ]
        );
    }

    #[test]
    fn resize_recreates_targets_and_updates_constants() {
        let (mut frames, window, start) = frame_loop(720, 480);
        frames.render_frame(start).unwrap();

        let first = constants_of(&frames.backend().submitted[0]);
        assert_eq!(first.viewport, Vec2::new(720.0, 480.0));
        assert!((first.aspect - 0.6667).abs() < 1e-4);

        window.notify_resize(1280, 720);
        let now = start + Duration::from_millis(2500);
        frames.render_frame(now).unwrap();

        let backend = frames.backend();
        assert_eq!(backend.resizes, vec![(720, 480), (1280, 720)]);
        assert!(backend
            .render_targets
            .iter()
            .all(|t| (t.width, t.height) == (1280, 720)));

        let list = backend.submitted.last().unwrap();
        let constants = constants_of(list);
        assert_eq!(constants.viewport, Vec2::new(1280.0, 720.0));
        assert!((constants.aspect - 0.5625).abs() < f32::EPSILON);
        assert!((constants.uptime - 2.5).abs() < 1e-6);
        assert!(list.contains(&Cmd::Viewport(Viewport::full(1280, 720))));
        assert!(list.contains(&Cmd::Scissor(ScissorRect::full(1280, 720))));
        assert_eq!(frames.extent(), (1280, 720));
    }

    #[test]
    fn target_count_holds_across_resizes() {
        for buffer_count in 2..=4 {
            let window = Arc::new(WindowState::new(720, 480));
            let start = Instant::now();
            let mut frames =
                FrameLoop::new(FakeBackend::new(buffer_count), window.clone(), CLEAR, 3, start);

            for (w, h) in [(800, 600), (1024, 768), (640, 360)] {
                window.notify_resize(w, h);
                frames.render_frame(start).unwrap();
                let targets = &frames.backend().render_targets;
                assert_eq!(targets.len(), buffer_count as usize);
                for (i, target) in targets.iter().enumerate() {
                    assert_eq!(target.heap_slot, i as u64 * RTV_STRIDE);
                }
            }
        }
    }

    #[test]
    fn minimized_window_skips_and_keeps_resize_pending() {
        let (mut frames, window, start) = frame_loop(720, 480);
        frames.render_frame(start).unwrap();

        window.notify_resize(0, 0);
        assert_eq!(frames.render_frame(start).unwrap(), FrameOutcome::Skipped);
        assert!(window.is_resize_pending());
        assert_eq!(frames.backend().submitted.len(), 1);

        window.notify_resize(1024, 768);
        frames.render_frame(start).unwrap();
        assert_eq!(frames.backend().resizes.last(), Some(&(1024, 768)));
        assert_eq!(frames.backend().submitted.len(), 2);
    }

    #[test]
    fn out_of_date_chain_is_recreated_next_frame() {
        let (mut frames, window, start) = frame_loop(720, 480);
        frames.render_frame(start).unwrap();

        frames.backend_mut().out_of_date_acquires = 1;
        assert_eq!(frames.render_frame(start).unwrap(), FrameOutcome::Skipped);
        assert!(window.is_resize_pending());
        // Nothing was recorded for the skipped frame.
        assert!(frames.backend().commands.is_empty());

        frames.render_frame(start).unwrap();
        assert_eq!(frames.backend().resizes.len(), 2);
        assert_eq!(frames.fence_value(), 2);
    }

    #[test]
    fn suboptimal_present_requests_resize() {
        let (mut frames, window, start) = frame_loop(720, 480);
        frames.backend_mut().needs_resize_presents = 1;
        frames.render_frame(start).unwrap();
        assert!(window.is_resize_pending());
        frames.render_frame(start).unwrap();
        assert_eq!(frames.backend().resizes.len(), 2);
    }

    #[test]
    fn fps_reported_after_one_second() {
        let (mut frames, _window, start) = frame_loop(720, 480);
        let step = Duration::from_nanos(16_666_667);
        let mut last = FrameOutcome::Skipped;
        for i in 1..=60 {
            last = frames.render_frame(start + step * i).unwrap();
        }
        match last {
            FrameOutcome::Rendered(Some(report)) => assert!((report.fps - 60.0).abs() < 0.05),
            other => panic!("expected an FPS report, got {other:?}"),
        }
    }
}
