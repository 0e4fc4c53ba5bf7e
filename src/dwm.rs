//! Compositor handlers. The compositor consumes the per-window hand-off
//! slots, and its own fullscreen present carries every queued present to the
//! screen with it.

use crate::consumer::{LossKind, PresentConsumer};
use crate::events::EventHeader;
use crate::present::PresentMode;

impl PresentConsumer {
    /// The compositor scheduled a present on this thread; the next kernel
    /// flip on it is the compositor's own.
    pub(crate) fn handle_dwm_schedule_present(&mut self, hdr: &EventHeader) {
        self.dwm_pid = hdr.pid;
        self.dwm_present_tid = hdr.tid;
    }

    /// The compositor read the present history: every copy-model present
    /// handed off per window is now queued on the compositor's next present.
    pub(crate) fn handle_dwm_get_present_history(&mut self, hdr: &EventHeader) {
        self.dwm_pid = hdr.pid;
        let entries: Vec<_> = self.store.by_window_last.drain().map(|(_, h)| h).collect();
        for h in entries {
            let queue = match self.store.get_mut(h) {
                Some(rec)
                    if matches!(
                        rec.present_mode,
                        PresentMode::ComposedCopyGpu | PresentMode::ComposedCopyCpu
                    ) && !rec.in_compositor_wait =>
                {
                    rec.in_compositor_wait = true;
                    rec.dwm_notified = true;
                    true
                }
                // Flip-model entries just leave the per-window slot; the
                // token state machine keeps tracking them.
                _ => false,
            };
            if queue {
                self.store.waiting_for_compositor.push_back(h);
            }
        }
    }

    /// A flip-chain notification ties a legacy blit token back to its
    /// window, making the record the window's current hand-off.
    pub(crate) fn handle_dwm_flip_chain(
        &mut self,
        hdr: &EventHeader,
        flip_chain_id: u32,
        serial_number: u32,
        hwnd: u64,
    ) {
        self.dwm_pid = hdr.pid;
        let token = ((flip_chain_id as u64) << 32) | serial_number as u64;
        let Some(&h) = self.store.by_legacy_blit_token.get(&token) else {
            self.note_orphan("flip-chain", token);
            return;
        };
        self.store.by_legacy_blit_token.remove(&token);
        if let Some(rec) = self.store.get_mut(h) {
            rec.hwnd = hwnd;
            rec.dwm_notified = true;
        } else {
            return;
        }
        if hwnd != 0 {
            if let Some(prev) = self.store.index_window_last(hwnd, h) {
                self.push_lost(prev, LossKind::Replacement);
            }
        }
    }
}
