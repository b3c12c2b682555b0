//! Bounded pool of decode targets shared by the decoder and the presenter.

use std::time::{Duration, Instant};

use media_io::{ChromaFormat, PlanarFrame, SliceRef};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, instrument, trace, warn};

use crate::deinterlace::FieldSync;
use crate::gpu::CompletionToken;
use crate::resources::FrameTextures;
use crate::RendererError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Owned by the decoder.
    Decoding,
    /// Complete and uploaded, waiting to be shown.
    Ready,
    /// Bound to a queued flip; shown by that flip and never superseded.
    Flipped,
    /// Being read by the presenter.
    Presenting,
    /// Shown at least once; the fallback picture until a newer frame is ready.
    Displayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub width: u32,
    pub height: u32,
    pub chroma: ChromaFormat,
    pub count: usize,
    /// Luma, U and V code values slots are cleared to.
    pub black: [u8; 3],
}

#[derive(Debug)]
pub struct FrameSlot {
    pub frame: PlanarFrame,
    pub textures: Option<FrameTextures>,
    pub field: FieldSync,
    pub sequence: u64,
    /// Resolves once the latest upload of `frame` has landed in `textures`.
    pub uploaded: Option<CompletionToken>,
}

impl FrameSlot {
    fn new(config: &RingConfig) -> Result<Self, RendererError> {
        let [y, u, v] = config.black;
        Ok(Self {
            frame: PlanarFrame::solid(config.width, config.height, config.chroma, [y, u, v])?,
            textures: None,
            field: FieldSync::None,
            sequence: 0,
            uploaded: None,
        })
    }
}

#[derive(Debug, Default)]
struct RingState {
    config: Option<RingConfig>,
    states: Vec<SlotState>,
    decode_index: usize,
    render_index: Option<usize>,
    last_displayed: Option<usize>,
    sequence: u64,
    sequences: Vec<u64>,
}

impl RingState {
    fn count(&self) -> usize {
        self.states.len()
    }
}

pub struct FrameBufferRing {
    state: Mutex<RingState>,
    changed: Condvar,
    slots: RwLock<Vec<Mutex<FrameSlot>>>,
}

impl Default for FrameBufferRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBufferRing {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            changed: Condvar::new(),
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Allocates `config.count` cleared slots, handing each to `attach` for
    /// its textures. Identical configurations keep the existing slots and
    /// return `Ok(false)`.
    pub fn configure<F>(&self, config: RingConfig, mut attach: F) -> Result<bool, RendererError>
    where
        F: FnMut(usize, &mut FrameSlot) -> Result<(), RendererError>,
    {
        if config.width == 0 || config.height == 0 || config.count == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "ring of {} slots at {}x{}",
                config.count, config.width, config.height
            )));
        }
        if self.state.lock().config == Some(config) {
            debug!("[ring] configuration unchanged");
            return Ok(false);
        }

        let mut slots = Vec::with_capacity(config.count);
        for index in 0..config.count {
            let mut slot = FrameSlot::new(&config)?;
            attach(index, &mut slot)?;
            slots.push(Mutex::new(slot));
        }

        let mut guard = self.slots.write();
        let old = std::mem::replace(&mut *guard, slots);
        let mut state = self.state.lock();
        *state = RingState {
            config: Some(config),
            states: vec![SlotState::Free; config.count],
            sequences: vec![0; config.count],
            ..Default::default()
        };
        drop(state);
        drop(guard);
        drop(old);

        if config.count == 1 {
            warn!("[ring] single buffer: decode and present share a slot, tearing is possible");
        }
        debug!(
            width = config.width,
            height = config.height,
            count = config.count,
            "[ring] configured"
        );
        self.changed.notify_all();
        Ok(true)
    }

    /// Removes every slot, returning them so their textures can be retired.
    pub fn teardown(&self) -> Vec<FrameSlot> {
        let slots = std::mem::take(&mut *self.slots.write());
        *self.state.lock() = RingState::default();
        self.changed.notify_all();
        slots.into_iter().map(Mutex::into_inner).collect()
    }

    pub fn is_configured(&self) -> bool {
        self.state.lock().config.is_some()
    }

    pub fn config(&self) -> Option<RingConfig> {
        self.state.lock().config
    }

    pub fn count(&self) -> usize {
        self.state.lock().count()
    }

    pub fn decode_index(&self) -> usize {
        self.state.lock().decode_index
    }

    pub fn render_index(&self) -> Option<usize> {
        self.state.lock().render_index
    }

    pub fn last_displayed(&self) -> Option<usize> {
        self.state.lock().last_displayed
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.state.lock().states.get(index).copied()
    }

    /// Slot being decoded into and slot being presented, if any.
    pub fn in_progress(&self) -> (Option<usize>, Option<usize>) {
        let state = self.state.lock();
        let decoding = state.states.iter().position(|s| *s == SlotState::Decoding);
        (decoding, state.render_index)
    }

    /// Hands the decoder its current slot, waiting up to `timeout` while the
    /// presenter still reads it or a queued flip still owns it.
    pub fn acquire_decode_slot(&self, timeout: Duration) -> Result<usize, RendererError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.config.is_none() {
            return Err(RendererError::NotConfigured);
        }
        let index = state.decode_index;
        if state.states[index] == SlotState::Decoding {
            return Ok(index);
        }
        if state.count() > 1 {
            while matches!(state.states[index], SlotState::Presenting | SlotState::Flipped) {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    warn!(index, state = ?state.states[index], "[ring] decode slot still owned by the presenter");
                    return Err(RendererError::SlotBusy(index));
                }
                if state.config.is_none() {
                    return Err(RendererError::NotConfigured);
                }
            }
        }
        if state.states[index] == SlotState::Ready {
            debug!(index, "[ring] overwriting a frame that was never shown");
        }
        if state.last_displayed == Some(index) && state.count() > 1 {
            state.last_displayed = None;
        }
        state.states[index] = SlotState::Decoding;
        trace!(index, "[ring] decode slot acquired");
        Ok(index)
    }

    /// Copies a band of decoded rows into the decode slot. Once the band
    /// reaches the bottom of the frame, `commit` uploads the slot and the
    /// decode index advances; the committed index is returned.
    #[instrument(name = "ring.draw_slice", skip_all, fields(y = slice.y, rows = slice.height))]
    pub fn draw_slice<F>(
        &self,
        slice: &SliceRef<'_>,
        timeout: Duration,
        commit: F,
    ) -> Result<Option<usize>, RendererError>
    where
        F: FnOnce(&mut FrameSlot) -> Result<(), RendererError>,
    {
        let index = self.acquire_decode_slot(timeout)?;
        let slots = self.slots.read();
        let mut slot = Self::lock_slot(&slots, index)?;
        let extent = slot.frame.draw_slice(slice)?;
        if !extent.reaches(slot.frame.height()) {
            return Ok(None);
        }
        commit(&mut slot)?;
        drop(slot);
        drop(slots);
        self.complete(index, FieldSync::None);
        Ok(Some(index))
    }

    /// Commits the decode slot for decoders that deliver whole frames.
    pub fn release_decode_slot<F>(&self, field: FieldSync, commit: F) -> Result<usize, RendererError>
    where
        F: FnOnce(&mut FrameSlot) -> Result<(), RendererError>,
    {
        let index = {
            let state = self.state.lock();
            if state.config.is_none() {
                return Err(RendererError::NotConfigured);
            }
            if state.states[state.decode_index] != SlotState::Decoding {
                return Err(RendererError::InvalidConfiguration(
                    "no decode slot acquired".into(),
                ));
            }
            state.decode_index
        };
        let slots = self.slots.read();
        let mut slot = Self::lock_slot(&slots, index)?;
        slot.field = field;
        commit(&mut slot)?;
        drop(slot);
        drop(slots);
        self.complete(index, field);
        Ok(index)
    }

    fn complete(&self, index: usize, field: FieldSync) {
        let mut state = self.state.lock();
        if state.states.get(index) != Some(&SlotState::Decoding) {
            return;
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state.sequences[index] = sequence;
        state.states[index] = SlotState::Ready;
        state.decode_index = (index + 1) % state.count();
        trace!(index, sequence, ?field, next = state.decode_index, "[ring] frame committed");
        drop(state);
        if let Some(slot) = self.slots.read().get(index) {
            slot.lock().sequence = sequence;
        }
        self.changed.notify_all();
    }

    /// Picks the newest ready frame for presentation, or the last displayed
    /// one when nothing new arrived.
    pub fn begin_render(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.config.is_none() || state.render_index.is_some() {
            return None;
        }
        let newest = (0..state.count())
            .filter(|&i| state.states[i] == SlotState::Ready)
            .max_by_key(|&i| state.sequences[i]);
        let index = match newest {
            Some(index) => index,
            None => {
                let last = state.last_displayed?;
                let usable = state.states[last] == SlotState::Displayed
                    || (state.count() == 1 && state.states[last] == SlotState::Decoding);
                if !usable {
                    return None;
                }
                last
            }
        };
        // Older ready frames are superseded.
        for i in 0..state.count() {
            if i != index && state.states[i] == SlotState::Ready {
                state.states[i] = SlotState::Free;
            }
        }
        if state.states[index] != SlotState::Decoding {
            state.states[index] = SlotState::Presenting;
        }
        state.render_index = Some(index);
        Some(index)
    }

    /// Binds the newest committed frame to a flip. The slot stays out of the
    /// decoder's reach until [`FrameBufferRing::begin_render_slot`] has shown
    /// it; older frames nobody flipped are superseded.
    pub fn flip(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.config.is_none() {
            return None;
        }
        let index = (0..state.count())
            .filter(|&i| state.states[i] == SlotState::Ready)
            .max_by_key(|&i| state.sequences[i])?;
        for i in 0..state.count() {
            if i != index && state.states[i] == SlotState::Ready {
                state.states[i] = SlotState::Free;
            }
        }
        state.states[index] = SlotState::Flipped;
        trace!(index, sequence = state.sequences[index], "[ring] frame flipped");
        drop(state);
        self.changed.notify_all();
        Some(index)
    }

    /// Starts presenting the slot bound by [`FrameBufferRing::flip`].
    pub fn begin_render_slot(&self, index: usize) -> Option<usize> {
        let mut state = self.state.lock();
        if state.config.is_none() || state.render_index.is_some() {
            return None;
        }
        match state.states.get(index).copied()? {
            SlotState::Flipped => state.states[index] = SlotState::Presenting,
            // A single slot is shared with the decoder.
            SlotState::Decoding if state.count() == 1 => {}
            _ => return None,
        }
        state.render_index = Some(index);
        Some(index)
    }

    /// Presents the last displayed frame again, ignoring newer ready ones.
    pub fn begin_render_last(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.render_index.is_some() {
            return None;
        }
        let last = state.last_displayed?;
        if state.states[last] != SlotState::Displayed {
            return None;
        }
        state.states[last] = SlotState::Presenting;
        state.render_index = Some(last);
        Some(last)
    }

    /// Abandons a render without showing the frame; it stays ready.
    pub fn cancel_render(&self, index: usize) {
        let mut state = self.state.lock();
        if state.render_index != Some(index) {
            return;
        }
        state.render_index = None;
        if state.states[index] == SlotState::Presenting {
            state.states[index] = if state.last_displayed == Some(index) {
                SlotState::Displayed
            } else {
                SlotState::Ready
            };
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn end_render(&self, index: usize) {
        let mut state = self.state.lock();
        if state.render_index != Some(index) {
            return;
        }
        state.render_index = None;
        if state.states[index] == SlotState::Presenting {
            state.states[index] = SlotState::Displayed;
        }
        if let Some(previous) = state.last_displayed {
            if previous != index && state.states[previous] == SlotState::Displayed {
                state.states[previous] = SlotState::Free;
            }
        }
        state.last_displayed = Some(index);
        drop(state);
        self.changed.notify_all();
    }

    /// Runs `f` with exclusive access to slot `index`.
    pub fn with_slot<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut FrameSlot) -> R,
    ) -> Result<R, RendererError> {
        let slots = self.slots.read();
        let mut slot = Self::lock_slot(&slots, index)?;
        Ok(f(&mut slot))
    }

    fn lock_slot(slots: &[Mutex<FrameSlot>], index: usize) -> Result<MutexGuard<'_, FrameSlot>, RendererError> {
        slots
            .get(index)
            .map(Mutex::lock)
            .ok_or(RendererError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_io::PlaneKind;

    const WAIT: Duration = Duration::from_millis(20);

    fn config(count: usize) -> RingConfig {
        RingConfig {
            width: 16,
            height: 8,
            chroma: ChromaFormat::YUV420,
            count,
            black: [16, 128, 128],
        }
    }

    fn full_frame(ring: &FrameBufferRing) -> Option<usize> {
        let source = PlanarFrame::solid(16, 8, ChromaFormat::YUV420, [200, 90, 160]).expect("frame");
        ring.draw_slice(&source.slice(0, 8), WAIT, |_| Ok(()))
            .expect("slice")
    }

    #[test]
    fn unconfigured_ring_refuses_work() {
        let ring = FrameBufferRing::new();
        assert!(matches!(
            ring.acquire_decode_slot(WAIT),
            Err(RendererError::NotConfigured)
        ));
        assert!(ring.begin_render().is_none());
    }

    #[test]
    fn slots_start_black() {
        let ring = FrameBufferRing::new();
        ring.configure(config(2), |_, _| Ok(())).expect("configure");
        let luma = ring
            .with_slot(1, |slot| slot.frame.plane(PlaneKind::Luma).data()[0])
            .expect("slot");
        assert_eq!(luma, 16);
    }

    #[test]
    fn partial_slices_do_not_advance() {
        let ring = FrameBufferRing::new();
        ring.configure(config(2), |_, _| Ok(())).expect("configure");
        let source = PlanarFrame::solid(16, 8, ChromaFormat::YUV420, [50, 128, 128]).expect("frame");
        assert_eq!(ring.draw_slice(&source.slice(0, 4), WAIT, |_| Ok(())).expect("top"), None);
        assert_eq!(ring.decode_index(), 0);
        assert_eq!(ring.draw_slice(&source.slice(4, 4), WAIT, |_| Ok(())).expect("bottom"), Some(0));
        assert_eq!(ring.decode_index(), 1);
        assert_eq!(ring.slot_state(0), Some(SlotState::Ready));
    }

    #[test]
    fn render_takes_newest_ready_frame() {
        let ring = FrameBufferRing::new();
        ring.configure(config(3), |_, _| Ok(())).expect("configure");
        full_frame(&ring);
        full_frame(&ring);
        assert_eq!(ring.begin_render(), Some(1));
        assert_eq!(ring.slot_state(0), Some(SlotState::Free));
        ring.end_render(1);
        assert_eq!(ring.begin_render(), Some(1));
        ring.end_render(1);
        assert_eq!(ring.last_displayed(), Some(1));
    }

    #[test]
    fn decoder_waits_for_presenting_slot() {
        let ring = FrameBufferRing::new();
        ring.configure(config(2), |_, _| Ok(())).expect("configure");
        full_frame(&ring);
        full_frame(&ring);
        // Slot 1 is the newest, slot 0 was superseded and is the next decode target.
        assert_eq!(ring.begin_render(), Some(1));
        assert_eq!(ring.acquire_decode_slot(WAIT).expect("free slot"), 0);
        full_frame(&ring);
        assert!(matches!(
            ring.acquire_decode_slot(WAIT),
            Err(RendererError::SlotBusy(1))
        ));
        ring.end_render(1);
        assert_eq!(ring.acquire_decode_slot(WAIT).expect("released"), 1);
    }

    #[test]
    fn flipped_frame_survives_newer_commits() {
        let ring = FrameBufferRing::new();
        ring.configure(config(3), |_, _| Ok(())).expect("configure");
        full_frame(&ring);
        assert_eq!(ring.flip(), Some(0));
        full_frame(&ring);
        // The unflipped frame does not replace the flipped one.
        assert_eq!(ring.begin_render_slot(0), Some(0));
        assert_eq!(ring.slot_state(1), Some(SlotState::Ready));
        ring.end_render(0);
        assert_eq!(ring.last_displayed(), Some(0));
        assert_eq!(ring.flip(), Some(1));
        assert_eq!(ring.flip(), None);
    }

    #[test]
    fn decoder_waits_for_flipped_slot() {
        let ring = FrameBufferRing::new();
        ring.configure(config(2), |_, _| Ok(())).expect("configure");
        full_frame(&ring);
        assert_eq!(ring.flip(), Some(0));
        full_frame(&ring);
        assert_eq!(ring.flip(), Some(1));
        assert!(matches!(
            ring.acquire_decode_slot(WAIT),
            Err(RendererError::SlotBusy(0))
        ));
        assert_eq!(ring.begin_render(), None);
        assert_eq!(ring.begin_render_slot(0), Some(0));
        ring.end_render(0);
        assert_eq!(ring.begin_render_slot(1), Some(1));
        ring.end_render(1);
        assert_eq!(ring.slot_state(0), Some(SlotState::Free));
        assert_eq!(ring.acquire_decode_slot(WAIT).expect("released"), 0);
    }

    #[test]
    fn identical_configuration_is_kept() {
        let ring = FrameBufferRing::new();
        let mut attached = 0;
        assert!(ring.configure(config(2), |_, _| {
            attached += 1;
            Ok(())
        })
        .expect("first"));
        assert!(!ring.configure(config(2), |_, _| {
            attached += 1;
            Ok(())
        })
        .expect("second"));
        assert_eq!(attached, 2);
        assert_eq!(ring.count(), 2);
    }

    #[test]
    fn whole_frame_release() {
        let ring = FrameBufferRing::new();
        ring.configure(config(2), |_, _| Ok(())).expect("configure");
        assert!(ring.release_decode_slot(FieldSync::Odd, |_| Ok(())).is_err());
        ring.acquire_decode_slot(WAIT).expect("acquire");
        assert_eq!(ring.release_decode_slot(FieldSync::Odd, |_| Ok(())).expect("release"), 0);
        let field = ring.with_slot(0, |slot| slot.field).expect("slot");
        assert_eq!(field, FieldSync::Odd);
    }
}
