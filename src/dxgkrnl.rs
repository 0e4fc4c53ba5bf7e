//! Graphics-kernel handlers.
//!
//! The kernel reports each present's journey as a series of events keyed in
//! turn by thread, kernel context, queue submit sequence, and present-history
//! token. The per-path sequences, briefly:
//!
//! - Legacy flip: flip (thread) -> queue submit (thread, learns the submit
//!   sequence) -> mmio flip (sequence, ready) -> sync DPC (sequence, screen).
//! - Front-buffer copy: blit (thread) -> queue submit -> queue complete
//!   (ready and screen are both the completion time).
//! - Composed paths: a present-history token is assigned on the issuing
//!   thread and the propagate event marks the hand-off to the compositor.

use crate::consumer::{LossKind, PresentConsumer};
use crate::events::EventHeader;
use crate::present::{PresentMode, PresentResult, Runtime};
use crate::providers::{FlipEntryStatus, PresentModel, QueuePacketType, SET_VIDPN_FLAG_FLIP_IMMEDIATE};
use crate::store::Handle;

impl PresentConsumer {
    /// A blit either targets the front buffer directly or is redirected into
    /// a composition surface. Redirected blits stay tentative until either a
    /// present-history token (composed) or a plain queue packet on the same
    /// context (front buffer after all) settles it.
    pub(crate) fn handle_dxgk_blit(&mut self, hdr: &EventHeader, hwnd: u64, context: u64, redirected: bool) {
        let h = self.find_or_create(hdr);
        if let Some(rec) = self.store.get_mut(h) {
            rec.hwnd = hwnd;
            rec.kernel_context = context;
            if redirected {
                if rec.present_mode == PresentMode::Unknown {
                    rec.present_mode = PresentMode::ComposedCopyGpu;
                }
                rec.supports_tearing = false;
            } else {
                rec.present_mode = PresentMode::HardwareLegacyCopyToFrontBuffer;
                rec.supports_tearing = true;
            }
        }
        if context != 0 {
            if let Some(prev) = self.store.index_blit_context(context, h) {
                self.push_lost(prev, LossKind::Replacement);
            }
        }
    }

    /// The kernel optimized the blit out entirely; the caller saw success but
    /// nothing will be displayed.
    pub(crate) fn handle_dxgk_blit_cancel(&mut self, hdr: &EventHeader) {
        let Some(&h) = self.store.by_thread.get(&hdr.tid) else {
            self.note_orphan("blit-cancel", hdr.tid as u64);
            return;
        };
        match self.store.get_mut(h) {
            Some(rec) if !rec.is_completed => rec.final_state = PresentResult::Discarded,
            _ => return,
        }
        self.complete_present(h);
    }

    pub(crate) fn handle_dxgk_flip(&mut self, hdr: &EventHeader, interval: i32, mmio: bool) {
        let h = self.find_or_create(hdr);
        if let Some(rec) = self.store.get_mut(h) {
            if rec.present_mode == PresentMode::Unknown {
                rec.present_mode = PresentMode::HardwareLegacyFlip;
            }
            if rec.sync_interval < 0 && interval >= 0 {
                rec.sync_interval = interval;
            }
            rec.mmio = mmio;
            // An immediate flip that bypasses the mmio path can tear.
            if !mmio && interval == 0 {
                rec.supports_tearing = true;
            }
        }
        // The compositor's own present adopts every present queued for it;
        // they will inherit its screen time when it completes.
        if self.dwm_present_tid != 0 && hdr.tid == self.dwm_present_tid {
            let waiting: Vec<Handle> = self.store.waiting_for_compositor.drain(..).collect();
            let live: Vec<Handle> = waiting
                .into_iter()
                .filter(|&wh| wh != h && self.store.get(wh).is_some())
                .collect();
            if let Some(rec) = self.store.get_mut(h) {
                rec.dependents.extend(live);
            }
            self.dwm_present_tid = 0;
        }
    }

    pub(crate) fn handle_dxgk_queue_submit(
        &mut self,
        hdr: &EventHeader,
        packet_type: QueuePacketType,
        submit_sequence: u32,
        context: u64,
        present: bool,
    ) {
        // A pipeline packet on a context with an unresolved blit means no
        // present-history token is coming: the blit goes straight to the
        // front buffer. Wait and signal packets say nothing about that.
        if !matches!(
            packet_type,
            QueuePacketType::WaitCommandBuffer | QueuePacketType::SignalCommandBuffer
        ) {
            if let Some(&bh) = self.store.by_blit_context.get(&context) {
                self.store.by_blit_context.remove(&context);
                if let Some(rec) = self.store.get_mut(bh) {
                    if rec.present_mode == PresentMode::ComposedCopyGpu && rec.token_ptr == 0 {
                        rec.present_mode = PresentMode::HardwareLegacyCopyToFrontBuffer;
                        rec.supports_tearing = true;
                    }
                }
            }
        }

        if present && submit_sequence != 0 {
            if let Some(&h) = self.store.by_thread.get(&hdr.tid) {
                let assign = self
                    .store
                    .get(h)
                    .map(|rec| !rec.is_completed && rec.submit_sequence == 0)
                    .unwrap_or(false);
                if assign {
                    if let Some(rec) = self.store.get_mut(h) {
                        rec.submit_sequence = submit_sequence;
                    }
                    if let Some(prev) = self.store.index_submit_sequence(submit_sequence, h) {
                        self.push_lost(prev, LossKind::Replacement);
                    }
                }
            }
        }
    }

    /// Queue completion is the terminal event for copies to the front buffer
    /// and for legacy flips that bypass the mmio flip path.
    pub(crate) fn handle_dxgk_queue_complete(&mut self, hdr: &EventHeader, submit_sequence: u32) {
        let Some(h) = self.find_by_submit_sequence(submit_sequence) else {
            self.note_orphan("queue-complete", submit_sequence as u64);
            return;
        };
        let mut complete = false;
        if let Some(rec) = self.store.get_mut(h) {
            if rec.present_mode == PresentMode::HardwareLegacyCopyToFrontBuffer
                || (rec.present_mode == PresentMode::HardwareLegacyFlip && !rec.mmio)
            {
                rec.ready_time = hdr.qpc;
                rec.screen_time = hdr.qpc;
                rec.final_state = PresentResult::Presented;
                complete = true;
            }
        }
        if complete {
            self.complete_present(h);
        }
    }

    pub(crate) fn handle_dxgk_mmio_flip(&mut self, hdr: &EventHeader, submit_sequence: u32, flags: u32) {
        let Some(h) = self.find_by_submit_sequence(submit_sequence) else {
            self.note_orphan("mmio-flip", submit_sequence as u64);
            return;
        };
        let mut complete = false;
        if let Some(rec) = self.store.get_mut(h) {
            rec.ready_time = hdr.qpc;
            if rec.present_mode == PresentMode::ComposedFlip {
                rec.present_mode = PresentMode::HardwareIndependentFlip;
            }
            if flags & SET_VIDPN_FLAG_FLIP_IMMEDIATE != 0 {
                rec.final_state = PresentResult::Presented;
                rec.screen_time = hdr.qpc;
                rec.supports_tearing = true;
                complete = rec.present_mode.is_hardware_flip();
            }
        }
        if complete {
            self.complete_present(h);
        }
    }

    /// The multi-plane variant additionally reports the flip entry's state
    /// after the flip; anything but a vsync/hsync wait means the present
    /// will not wait for the next scanout boundary.
    pub(crate) fn handle_dxgk_mmio_flip_mpo(
        &mut self,
        hdr: &EventHeader,
        submit_sequence: u32,
        entry_status: Option<FlipEntryStatus>,
    ) {
        let Some(h) = self.find_by_submit_sequence(submit_sequence) else {
            self.note_orphan("mmio-flip-mpo", submit_sequence as u64);
            return;
        };
        let mut complete = false;
        if let Some(rec) = self.store.get_mut(h) {
            rec.ready_time = hdr.qpc;
            if rec.present_mode == PresentMode::ComposedFlip {
                rec.present_mode = PresentMode::HardwareIndependentFlip;
            }
            if let Some(status) = entry_status {
                if !matches!(status, FlipEntryStatus::FlipWaitVSync | FlipEntryStatus::FlipWaitHSync) {
                    rec.final_state = PresentResult::Presented;
                    rec.supports_tearing = true;
                    if status == FlipEntryStatus::FlipWaitComplete {
                        rec.screen_time = hdr.qpc;
                    }
                    complete = rec.present_mode.is_hardware_flip() && rec.screen_time != 0;
                }
            }
        }
        if complete {
            self.complete_present(h);
        }
    }

    /// A sync DPC puts the flipped surface on screen. More than one valid
    /// plane means the present was composed in hardware across planes.
    pub(crate) fn handle_dxgk_sync_dpc(&mut self, hdr: &EventHeader, submit_sequence: u32, valid_planes: usize) {
        let Some(h) = self.find_by_submit_sequence(submit_sequence) else {
            self.note_orphan("sync-dpc", submit_sequence as u64);
            return;
        };
        let mut complete = false;
        if let Some(rec) = self.store.get_mut(h) {
            if valid_planes > 1
                && matches!(
                    rec.present_mode,
                    PresentMode::HardwareIndependentFlip | PresentMode::ComposedFlip
                )
            {
                rec.present_mode = PresentMode::HardwareComposedIndependentFlip;
            }
            rec.screen_time = hdr.qpc;
            if rec.ready_time == 0 {
                // On screen without ever having been ready: the event that
                // carries the ready time was missed.
                rec.final_state = PresentResult::Error;
                complete = true;
            } else {
                rec.final_state = PresentResult::Presented;
                complete = rec.present_mode.is_hardware_flip();
            }
        }
        if complete {
            if self.store.get(h).map(|r| r.final_state) == Some(PresentResult::Error) {
                self.note_classification_error();
            }
            self.complete_present(h);
        }
    }

    /// The kernel's own present event; carries the window for composed
    /// copies and marks the end of kernel-side submission.
    pub(crate) fn handle_dxgk_present(&mut self, hdr: &EventHeader, hwnd: u64) {
        let Some(&h) = self.store.by_thread.get(&hdr.tid) else {
            self.note_orphan("dxgk-present", hdr.tid as u64);
            return;
        };
        let mut drop_thread = false;
        if let Some(rec) = self.store.get_mut(h) {
            rec.seen_dxgk_present = true;
            if rec.hwnd == 0 && hwnd != 0 {
                rec.hwnd = hwnd;
            }
            // With no runtime present in flight there is no stop event
            // coming; this is the last operation on the thread.
            drop_thread = rec.runtime == Runtime::Other;
        }
        if drop_thread {
            self.store.by_thread.remove(&hdr.tid);
        }
    }

    /// A kernel present-history token is assigned to the thread's current
    /// present; the token's model classifies the composed path.
    pub(crate) fn handle_dxgk_present_history(
        &mut self,
        hdr: &EventHeader,
        token: u64,
        model: PresentModel,
        token_data: u64,
    ) {
        // Plain GDI redirection is handled entirely by the window manager.
        if model == PresentModel::RedirectedGdi {
            return;
        }
        let h = self.find_or_create(hdr);
        let mut old_token = 0;
        let mut vista_token = 0;
        let mut context = 0;
        if let Some(rec) = self.store.get_mut(h) {
            if rec.token_ptr != 0 && rec.token_ptr != token {
                old_token = rec.token_ptr;
            }
            // A new token abandons whatever downstream state the old one
            // accumulated.
            rec.ready_time = 0;
            rec.screen_time = 0;
            rec.supports_tearing = false;
            rec.final_state = PresentResult::Unknown;
            rec.token_ptr = token;
            match model {
                PresentModel::RedirectedBlt => {
                    rec.present_mode = PresentMode::ComposedCopyGpu;
                }
                PresentModel::RedirectedVistaBlt => {
                    rec.present_mode = PresentMode::ComposedCopyCpu;
                    rec.legacy_blit_token = token_data;
                    vista_token = token_data;
                }
                PresentModel::RedirectedComposition => {
                    rec.present_mode = PresentMode::ComposedCompositionAtlas;
                }
                _ => {}
            }
            context = rec.kernel_context;
        }
        if old_token != 0 && self.store.by_kernel_token.get(&old_token) == Some(&h) {
            self.store.by_kernel_token.remove(&old_token);
        }
        // A history token settles the pending blit question: this present is
        // going to the compositor.
        if context != 0 && self.store.by_blit_context.get(&context) == Some(&h) {
            self.store.by_blit_context.remove(&context);
        }
        if let Some(prev) = self.store.index_kernel_token(token, h) {
            self.push_lost(prev, LossKind::Replacement);
        }
        if vista_token != 0 {
            if let Some(prev) = self.store.index_legacy_blit_token(vista_token, h) {
                self.push_lost(prev, LossKind::Replacement);
            }
        }
    }

    /// The token propagates to the compositor: the present's GPU work is
    /// done and the record moves into the per-window hand-off slot.
    pub(crate) fn handle_dxgk_present_history_info(&mut self, hdr: &EventHeader, token: u64) {
        let Some(&h) = self.store.by_kernel_token.get(&token) else {
            self.note_orphan("present-history-info", token);
            return;
        };
        self.store.by_kernel_token.remove(&token);
        let Some(rec) = self.store.get_mut(h) else { return };
        if rec.ready_time == 0 {
            rec.ready_time = hdr.qpc;
        }
        let mode = rec.present_mode;
        let hwnd = rec.hwnd;
        match mode {
            PresentMode::ComposedCopyGpu | PresentMode::ComposedCopyCpu => {
                if hwnd != 0 {
                    if let Some(prev) = self.store.index_window_last(hwnd, h) {
                        self.push_lost(prev, LossKind::Replacement);
                    }
                }
            }
            PresentMode::ComposedCompositionAtlas => {
                // No windowing events follow for atlas presents; assume the
                // compositor picks the buffer up on its next present.
                let queue = match self.store.get_mut(h) {
                    Some(rec) if !rec.in_compositor_wait => {
                        rec.in_compositor_wait = true;
                        rec.dwm_notified = true;
                        true
                    }
                    _ => false,
                };
                if queue {
                    self.store.waiting_for_compositor.push_back(h);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn handle_dxgk_independent_flip(&mut self, _hdr: &EventHeader, submit_sequence: u32) {
        let Some(h) = self.find_by_submit_sequence(submit_sequence) else {
            self.note_orphan("independent-flip", submit_sequence as u64);
            return;
        };
        if let Some(rec) = self.store.get_mut(h) {
            if rec.present_mode == PresentMode::ComposedFlip {
                rec.present_mode = PresentMode::HardwareIndependentFlip;
            }
        }
    }
}
