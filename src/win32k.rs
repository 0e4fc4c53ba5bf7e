//! Windowing handlers: composition-token assignment and the token state
//! machine that tracks flip-model presents through the compositor.

use crate::consumer::{LossKind, PresentConsumer};
use crate::events::EventHeader;
use crate::present::{PresentMode, PresentResult};
use crate::providers::{TokenState, DXGI_PRESENT_DO_NOT_SEQUENCE};

impl PresentConsumer {
    /// The windowing subsystem binds a composition token triple to the
    /// thread's present; from here on the token identifies it.
    pub(crate) fn handle_token_composition_surface(
        &mut self,
        hdr: &EventHeader,
        surface: u64,
        present_count: u64,
        bind_id: u64,
    ) {
        let h = self.find_or_create(hdr);
        let key = (surface, present_count, bind_id);
        let mut old_key = None;
        if let Some(rec) = self.store.get_mut(h) {
            let prev_key = (
                rec.composition_surface,
                rec.composition_present_count,
                rec.composition_bind_id,
            );
            if prev_key != (0, 0, 0) && prev_key != key {
                old_key = Some(prev_key);
            }
            if rec.present_mode == PresentMode::Unknown {
                rec.present_mode = PresentMode::ComposedFlip;
            }
            rec.seen_win32k_events = true;
            rec.composition_surface = surface;
            rec.composition_present_count = present_count;
            rec.composition_bind_id = bind_id;
        }
        if let Some(prev_key) = old_key {
            if self.store.by_composition_token.get(&prev_key) == Some(&h) {
                self.store.by_composition_token.remove(&prev_key);
            }
        }
        if let Some(prev) = self.store.index_composition_token(key, h) {
            self.push_lost(prev, LossKind::Replacement);
        }
    }

    pub(crate) fn handle_token_state_changed(
        &mut self,
        hdr: &EventHeader,
        key: (u64, u64, u64),
        state: TokenState,
        independent_flip: bool,
    ) {
        let Some(&h) = self.store.by_composition_token.get(&key) else {
            self.note_orphan("token-state-changed", key.0);
            return;
        };
        if self.store.get(h).is_none() {
            self.store.by_composition_token.remove(&key);
            return;
        }
        match state {
            // The compositor intends to show this token with its next frame.
            // Whatever was last handed off for the same window never made it.
            TokenState::InFrame => {
                let hwnd = {
                    let rec = self.store.get_mut(h).unwrap();
                    rec.seen_in_frame = true;
                    if independent_flip && rec.present_mode == PresentMode::ComposedFlip {
                        rec.present_mode = PresentMode::HardwareIndependentFlip;
                    }
                    rec.hwnd
                };
                if hwnd != 0 {
                    if let Some(&prev) = self.store.by_window_last.get(&hwnd) {
                        if prev != h {
                            self.store.by_window_last.remove(&hwnd);
                            if let Some(prev_rec) = self.store.get_mut(prev) {
                                prev_rec.final_state = PresentResult::Discarded;
                            }
                            self.complete_present(prev);
                        }
                    }
                    self.store.by_window_last.insert(hwnd, h);
                }
            }
            // The token made it into the composed frame; unless the present
            // asked not to be sequenced, it will reach the screen.
            TokenState::Confirmed => {
                let hwnd = {
                    let rec = self.store.get_mut(h).unwrap();
                    if rec.final_state == PresentResult::Unknown {
                        rec.final_state = if rec.present_flags & DXGI_PRESENT_DO_NOT_SEQUENCE != 0 {
                            PresentResult::Discarded
                        } else {
                            PresentResult::Presented
                        };
                    }
                    rec.hwnd
                };
                if hwnd != 0 && self.store.by_window_last.get(&hwnd) == Some(&h) {
                    self.store.by_window_last.remove(&hwnd);
                }
            }
            // Retirement stamps the on-screen time.
            TokenState::Retired => {
                let error = {
                    let rec = self.store.get_mut(h).unwrap();
                    rec.screen_time = hdr.qpc;
                    if rec.ready_time == 0 {
                        rec.final_state = PresentResult::Error;
                        true
                    } else {
                        false
                    }
                };
                if error {
                    self.note_classification_error();
                }
            }
            // Token destroyed; the record's journey ends here.
            TokenState::Discarded => {
                self.store.by_composition_token.remove(&key);
                {
                    let rec = self.store.get_mut(h).unwrap();
                    if rec.final_state == PresentResult::Unknown || rec.screen_time == 0 {
                        rec.final_state = PresentResult::Discarded;
                    }
                }
                self.complete_present(h);
            }
            TokenState::Completed => {}
        }
    }
}
