use anyhow::{ensure, Result};
use vulkanalia::vk;

use crate::config::FENCE_TIMEOUT_NS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: usize, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; the swapchain needs a rebuild.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The acquire reported an out-of-date swapchain. Nothing was recorded and
    /// the swapchain has already been rebuilt.
    Skipped,
    /// The framebuffer or surface has no area; nothing was acquired.
    Deferred,
}

/// The GPU-facing half of a frame. Every call is made from the render thread
/// in the order `FrameSync::draw_frame` documents.
///
/// `slot` indexes the frames-in-flight ring (command buffer, fence, uniform
/// buffer). `semaphore` indexes the present-complete ring, which is sized by
/// the swapchain image count.
pub trait FrameBackend {
    fn framebuffer_extent(&self) -> vk::Extent2D;
    unsafe fn wait_for_fence(&mut self, slot: usize, timeout: u64) -> Result<FenceStatus>;
    unsafe fn acquire_image(&mut self, semaphore: usize) -> Result<AcquireOutcome>;
    unsafe fn update_uniforms(&mut self, slot: usize) -> Result<()>;
    unsafe fn reset_fence(&mut self, slot: usize) -> Result<()>;
    unsafe fn record(&mut self, slot: usize, image_index: usize) -> Result<()>;
    unsafe fn submit(&mut self, slot: usize, semaphore: usize, image_index: usize) -> Result<()>;
    unsafe fn present(&mut self, image_index: usize) -> Result<PresentOutcome>;
    /// Drains the device and rebuilds everything sized by the swapchain.
    /// Returns the new image count, or `None` when the surface has no area
    /// and nothing was rebuilt.
    unsafe fn rebuild(&mut self) -> Result<Option<usize>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Fence observed signaled; the slot's resources may be touched.
    Idle,
    Recording,
    /// Submitted to the queue; the fence is pending.
    Submitted,
}

/// Indices of the two independently sized rings and the state of each frame
/// slot.
#[derive(Clone, Debug)]
pub struct FrameRing {
    slots: Vec<SlotState>,
    frame: usize,
    semaphore_index: usize,
    image_count: usize,
}

impl FrameRing {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        assert!(frames_in_flight > 0 && image_count > 0);
        Self {
            // Fences are created signaled.
            slots: vec![SlotState::Idle; frames_in_flight],
            frame: 0,
            semaphore_index: 0,
            image_count,
        }
    }

    #[cfg(test)]
    pub fn frame(&self) -> usize {
        self.frame
    }

    #[cfg(test)]
    pub fn semaphore_index(&self) -> usize {
        self.semaphore_index
    }

    #[cfg(test)]
    pub fn image_count(&self) -> usize {
        self.image_count
    }

    #[cfg(test)]
    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    fn observe_signaled(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Idle;
    }

    fn begin_recording(&mut self, slot: usize) -> Result<()> {
        ensure!(
            self.slots[slot] == SlotState::Idle,
            "Frame slot {} recorded while {:?}.",
            slot,
            self.slots[slot]
        );
        self.slots[slot] = SlotState::Recording;
        Ok(())
    }

    fn mark_submitted(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Submitted;
    }

    fn advance(&mut self) {
        self.semaphore_index = (self.semaphore_index + 1) % self.image_count;
        self.frame = (self.frame + 1) % self.slots.len();
    }

    /// The present-complete ring is recreated with the swapchain, so its
    /// index starts over.
    fn resize_images(&mut self, image_count: usize) {
        assert!(image_count > 0);
        self.image_count = image_count;
        self.semaphore_index = 0;
    }
}

/// Drives the acquire, record, submit, present protocol over a `FrameRing`.
#[derive(Debug)]
pub struct FrameSync {
    ring: FrameRing,
    stale: bool,
    resize_pending: bool,
}

impl FrameSync {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            ring: FrameRing::new(frames_in_flight, image_count),
            stale: false,
            resize_pending: false,
        }
    }

    #[cfg(test)]
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    #[cfg(test)]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Records a window resize. It is honored after the next present so the
    /// frame already in progress is not disturbed.
    pub fn notify_resized(&mut self) {
        self.resize_pending = true;
    }

    /// Renders one frame.
    ///
    /// 1. Rebuild first if the previous frame left the swapchain stale. A
    ///    surface without area defers the frame.
    /// 2. Wait for the slot's fence, retrying on timeout.
    /// 3. Acquire an image; out of date rebuilds and skips the frame with the
    ///    fence untouched.
    /// 4. Update uniforms, reset the fence and record.
    /// 5. Submit and present, then advance both rings.
    pub unsafe fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        let extent = backend.framebuffer_extent();
        if extent.width == 0 || extent.height == 0 {
            self.stale = true;
            return Ok(FrameOutcome::Deferred);
        }

        if self.stale && !self.rebuild(backend)? {
            return Ok(FrameOutcome::Deferred);
        }

        let slot = self.ring.frame;
        let semaphore = self.ring.semaphore_index;

        while backend.wait_for_fence(slot, FENCE_TIMEOUT_NS)? == FenceStatus::TimedOut {
            log::trace!("Fence for frame slot {} timed out, waiting again", slot);
        }
        self.ring.observe_signaled(slot);

        let image_index = match backend.acquire_image(semaphore)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.stale = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.stale = true;
                self.rebuild(backend)?;
                return Ok(FrameOutcome::Skipped);
            }
        };
        ensure!(
            image_index < self.ring.image_count,
            "Acquired image {} of {}.",
            image_index,
            self.ring.image_count
        );

        backend.update_uniforms(slot)?;

        self.ring.begin_recording(slot)?;
        backend.reset_fence(slot)?;
        backend.record(slot, image_index)?;

        backend.submit(slot, semaphore, image_index)?;
        self.ring.mark_submitted(slot);

        if backend.present(image_index)? == PresentOutcome::Stale {
            log::debug!("Swapchain stale on present");
            self.stale = true;
        }
        if self.resize_pending {
            self.resize_pending = false;
            self.stale = true;
        }

        self.ring.advance();

        Ok(FrameOutcome::Presented)
    }

    /// Returns `false` when the backend deferred; the swapchain stays stale.
    unsafe fn rebuild<B: FrameBackend>(&mut self, backend: &mut B) -> Result<bool> {
        let Some(image_count) = backend.rebuild()? else {
            return Ok(false);
        };
        if image_count != self.ring.image_count {
            log::info!(
                "Swapchain image count changed from {} to {}",
                self.ring.image_count,
                image_count
            );
        }
        self.ring.resize_images(image_count);
        // The rebuild already used the current framebuffer size.
        self.stale = false;
        self.resize_pending = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::MAX_FRAMES_IN_FLIGHT;
    use crate::error::RenderError;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Signaled(usize),
        TimedOut(usize),
        Acquire(usize),
        Update(usize),
        Reset(usize),
        Record(usize, usize),
        Submit(usize, usize, usize),
        Present(usize),
        Rebuild,
    }

    struct FakeBackend {
        calls: Vec<Call>,
        extent: vk::Extent2D,
        image_count: usize,
        next_image: usize,
        rebuilt_image_count: usize,
        deferred_rebuilds: usize,
        timeouts: VecDeque<usize>,
        acquires: VecDeque<Result<AcquireOutcome, vk::ErrorCode>>,
        presents: VecDeque<PresentOutcome>,
    }

    impl FakeBackend {
        fn new(image_count: usize) -> Self {
            Self {
                calls: Vec::new(),
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                image_count,
                next_image: 0,
                rebuilt_image_count: image_count,
                deferred_rebuilds: 0,
                timeouts: VecDeque::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
            }
        }

        fn position(&self, call: Call) -> usize {
            self.calls
                .iter()
                .position(|c| *c == call)
                .unwrap_or_else(|| panic!("{:?} never happened in {:?}", call, self.calls))
        }

        /// A slot is recorded only after its last submission's fence was
        /// observed signaled.
        fn assert_fences_respected(&self) {
            let mut waited = vec![true; MAX_FRAMES_IN_FLIGHT];
            for call in &self.calls {
                match *call {
                    Call::Signaled(slot) => waited[slot] = true,
                    Call::Submit(slot, ..) => waited[slot] = false,
                    Call::Record(slot, _) => {
                        assert!(waited[slot], "slot {} re-recorded early: {:?}", slot, self.calls)
                    }
                    _ => {}
                }
            }
        }
    }

    impl FrameBackend for FakeBackend {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            self.extent
        }

        unsafe fn wait_for_fence(&mut self, slot: usize, _timeout: u64) -> Result<FenceStatus> {
            match self.timeouts.front_mut() {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    self.calls.push(Call::TimedOut(slot));
                    Ok(FenceStatus::TimedOut)
                }
                _ => {
                    self.timeouts.pop_front();
                    self.calls.push(Call::Signaled(slot));
                    Ok(FenceStatus::Signaled)
                }
            }
        }

        unsafe fn acquire_image(&mut self, semaphore: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(semaphore));
            match self.acquires.pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(code)) => Err(RenderError::Acquire(code).into()),
                None => {
                    let image_index = self.next_image % self.image_count;
                    self.next_image += 1;
                    Ok(AcquireOutcome::Acquired {
                        image_index,
                        suboptimal: false,
                    })
                }
            }
        }

        unsafe fn update_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Update(slot));
            Ok(())
        }

        unsafe fn reset_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        unsafe fn record(&mut self, slot: usize, image_index: usize) -> Result<()> {
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        unsafe fn submit(&mut self, slot: usize, semaphore: usize, image_index: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot, semaphore, image_index));
            Ok(())
        }

        unsafe fn present(&mut self, image_index: usize) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        unsafe fn rebuild(&mut self) -> Result<Option<usize>> {
            self.calls.push(Call::Rebuild);
            if self.deferred_rebuilds > 0 {
                self.deferred_rebuilds -= 1;
                return Ok(None);
            }
            self.image_count = self.rebuilt_image_count;
            self.next_image = 0;
            Ok(Some(self.image_count))
        }
    }

    fn draw(sync: &mut FrameSync, backend: &mut FakeBackend) -> FrameOutcome {
        unsafe { sync.draw_frame(backend) }.unwrap()
    }

    #[test]
    fn single_frame_follows_protocol_order() {
        let mut backend = FakeBackend::new(3);
        let mut sync = FrameSync::new(MAX_FRAMES_IN_FLIGHT, 3);

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert_eq!(
            backend.calls,
            vec![
                Call::Signaled(0),
                Call::Acquire(0),
                Call::Update(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0, 0, 0),
                Call::Present(0),
            ]
        );
        assert_eq!(sync.ring().state(0), SlotState::Submitted);
        assert_eq!(sync.ring().frame(), 1);
        assert_eq!(sync.ring().semaphore_index(), 1);
    }

    #[test]
    fn slot_zero_is_reused_only_after_its_fence() {
        let mut backend = FakeBackend::new(3);
        let mut sync = FrameSync::new(2, 3);

        for _ in 0..3 {
            draw(&mut sync, &mut backend);
        }

        let first_submit = backend.position(Call::Submit(0, 0, 0));
        let third_record = backend.position(Call::Record(0, 2));
        let reuse_wait = backend.calls[first_submit..]
            .iter()
            .position(|c| *c == Call::Signaled(0))
            .map(|p| p + first_submit)
            .unwrap();
        assert!(first_submit < reuse_wait && reuse_wait < third_record);
        assert_eq!(backend.calls.last(), Some(&Call::Present(2)));
        backend.assert_fences_respected();
    }

    #[test]
    fn ring_indices_stay_in_range_and_advance_independently() {
        let mut backend = FakeBackend::new(3);
        let mut sync = FrameSync::new(2, 3);

        for n in 1..=10 {
            draw(&mut sync, &mut backend);
            assert_eq!(sync.ring().frame(), n % 2);
            assert_eq!(sync.ring().semaphore_index(), n % 3);
        }
        backend.assert_fences_respected();
    }

    #[test]
    fn fence_timeouts_are_retried() {
        let mut backend = FakeBackend::new(3);
        backend.timeouts.push_back(2);
        let mut sync = FrameSync::new(2, 3);

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert_eq!(
            &backend.calls[..4],
            &[
                Call::TimedOut(0),
                Call::TimedOut(0),
                Call::Signaled(0),
                Call::Acquire(0)
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_touching_the_fence() {
        let mut backend = FakeBackend::new(3);
        backend.acquires.push_back(Ok(AcquireOutcome::OutOfDate));
        let mut sync = FrameSync::new(2, 3);

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Skipped);
        assert_eq!(
            backend.calls,
            vec![Call::Signaled(0), Call::Acquire(0), Call::Rebuild]
        );
        assert_eq!(sync.ring().state(0), SlotState::Idle);
        assert_eq!(sync.ring().frame(), 0);
        assert!(!sync.is_stale());

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert!(backend.calls.contains(&Call::Record(0, 0)));
    }

    #[test]
    fn stale_present_rebuilds_before_the_next_acquire() {
        let mut backend = FakeBackend::new(3);
        backend.presents.push_back(PresentOutcome::Stale);
        let mut sync = FrameSync::new(2, 3);

        draw(&mut sync, &mut backend);
        assert!(sync.is_stale());
        assert!(!backend.calls.contains(&Call::Rebuild));

        draw(&mut sync, &mut backend);
        let rebuild = backend.position(Call::Rebuild);
        assert!(backend.position(Call::Present(0)) < rebuild);
        assert_eq!(backend.calls[rebuild + 1], Call::Signaled(1));
        assert_eq!(backend.calls[rebuild + 2], Call::Acquire(0));
    }

    #[test]
    fn resize_during_a_frame_is_handled_on_the_next_one() {
        let mut backend = FakeBackend::new(3);
        let mut sync = FrameSync::new(2, 3);

        sync.notify_resized();
        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert!(!backend.calls.contains(&Call::Rebuild));
        assert!(sync.is_stale());

        let before = backend.calls.len();
        draw(&mut sync, &mut backend);
        assert_eq!(backend.calls[before], Call::Rebuild);
        assert!(!sync.is_stale());
    }

    #[test]
    fn suboptimal_acquire_still_renders_then_rebuilds() {
        let mut backend = FakeBackend::new(3);
        backend.acquires.push_back(Ok(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        }));
        let mut sync = FrameSync::new(2, 3);

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert!(backend.calls.contains(&Call::Present(1)));
        assert!(sync.is_stale());
    }

    #[test]
    fn zero_area_framebuffer_never_acquires() {
        let mut backend = FakeBackend::new(3);
        backend.extent = vk::Extent2D {
            width: 0,
            height: 600,
        };
        let mut sync = FrameSync::new(2, 3);

        for _ in 0..3 {
            assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Deferred);
        }
        assert!(backend.calls.is_empty());
        assert!(sync.is_stale());

        backend.extent.width = 640;
        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert_eq!(backend.calls[0], Call::Rebuild);
    }

    #[test]
    fn zero_area_surface_defers_the_rebuild() {
        let mut backend = FakeBackend::new(3);
        backend.presents.push_back(PresentOutcome::Stale);
        let mut sync = FrameSync::new(2, 3);
        draw(&mut sync, &mut backend);

        // The window still has a size but the surface reports 0x0.
        backend.deferred_rebuilds = 2;
        let before = backend.calls.len();
        for _ in 0..2 {
            assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Deferred);
            assert!(sync.is_stale());
        }
        assert_eq!(&backend.calls[before..], &[Call::Rebuild, Call::Rebuild]);
        assert_eq!(sync.ring().frame(), 1);

        assert_eq!(draw(&mut sync, &mut backend), FrameOutcome::Presented);
        assert!(!sync.is_stale());
        assert_eq!(backend.calls[before + 2], Call::Rebuild);
        assert_eq!(backend.calls[before + 3], Call::Signaled(1));
        backend.assert_fences_respected();
    }

    #[test]
    fn image_count_change_resets_the_semaphore_ring() {
        let mut backend = FakeBackend::new(4);
        let mut sync = FrameSync::new(2, 4);

        for _ in 0..3 {
            draw(&mut sync, &mut backend);
        }
        assert_eq!(sync.ring().semaphore_index(), 3);

        backend.rebuilt_image_count = 2;
        backend.presents.push_back(PresentOutcome::Stale);
        draw(&mut sync, &mut backend);
        draw(&mut sync, &mut backend);

        assert_eq!(sync.ring().image_count(), 2);
        assert!(sync.ring().semaphore_index() < 2);
        for _ in 0..5 {
            draw(&mut sync, &mut backend);
            assert!(sync.ring().semaphore_index() < 2);
            assert!(sync.ring().frame() < 2);
        }
        backend.assert_fences_respected();
    }

    #[test]
    fn fatal_acquire_error_propagates() {
        let mut backend = FakeBackend::new(3);
        backend
            .acquires
            .push_back(Err(vk::ErrorCode::DEVICE_LOST));
        let mut sync = FrameSync::new(2, 3);

        let error = unsafe { sync.draw_frame(&mut backend) }.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RenderError>(),
            Some(RenderError::Acquire(vk::ErrorCode::DEVICE_LOST))
        ));
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Reset(_))));
    }

    #[test]
    fn recording_a_busy_slot_is_rejected() {
        let mut ring = FrameRing::new(2, 3);
        ring.begin_recording(0).unwrap();
        ring.mark_submitted(0);
        assert!(ring.begin_recording(0).is_err());

        ring.observe_signaled(0);
        assert!(ring.begin_recording(0).is_ok());
    }
}
