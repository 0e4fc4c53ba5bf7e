//! Typed events consumed by the engine.
//!
//! Each payload variant corresponds to one provider event; the decode from
//! raw trace records happens upstream. Events the engine does not recognize
//! arrive as [`Payload::Unknown`] and are ignored by the dispatcher.

use serde::{Deserialize, Serialize};

use crate::providers::{
    d3d9, dwm, dxgi, dxgkrnl, nt_process, win32k, FlipChainEvent, FlipEntryStatus, PresentModel,
    Provider, QueuePacketType, TokenState,
};

/// Common header fields every provider stamps on its events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub qpc: u64,
    pub pid: u32,
    pub tid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    DxgiPresentStart { swapchain: u64, flags: u32, sync_interval: i32 },
    DxgiPresentStop { result: u32 },
    DxgiPresentMpoStart { swapchain: u64, flags: u32, sync_interval: i32 },
    DxgiPresentMpoStop { result: u32 },
    D3d9PresentStart { swapchain: u64, flags: u32 },
    D3d9PresentStop { result: u32 },

    DxgkBlit { hwnd: u64, context: u64, redirected: bool },
    DxgkBlitCancel,
    DxgkFlip { interval: i32, mmio: bool },
    DxgkFlipMpo,
    DxgkQueueSubmit { packet_type: QueuePacketType, submit_sequence: u32, context: u64, present: bool },
    DxgkQueueComplete { submit_sequence: u32 },
    DxgkMmioFlip { submit_sequence: u32, flags: u32 },
    DxgkMmioFlipMpo { submit_sequence: u32, entry_status: Option<FlipEntryStatus> },
    DxgkVSyncDpc { submit_sequence: u32 },
    DxgkVSyncDpcMpo { plane_submit_sequences: Vec<u32> },
    DxgkHSyncDpcMpo { plane_submit_sequences: Vec<u32> },
    DxgkPresent { hwnd: u64 },
    DxgkPresentHistoryStart { token: u64, model: PresentModel, token_data: u64 },
    DxgkPresentHistoryDetailed { token: u64, model: PresentModel, token_data: u64 },
    DxgkPresentHistoryInfo { token: u64 },
    DxgkIndependentFlip { submit_sequence: u32 },

    Win32kTokenCompositionSurface { surface: u64, present_count: u64, bind_id: u64 },
    Win32kTokenStateChanged {
        surface: u64,
        present_count: u64,
        bind_id: u64,
        state: TokenState,
        independent_flip: bool,
    },

    DwmSchedulePresent,
    DwmGetPresentHistory,
    DwmFlipChain { event: FlipChainEvent, flip_chain_id: u32, serial_number: u32, hwnd: u64 },

    ProcessStart { image_name: String },
    ProcessStop { image_name: String },

    Unknown,
}

impl Payload {
    /// The provider and manifest event id this payload was decoded from.
    /// `None` for [`Payload::Unknown`].
    pub fn identity(&self) -> Option<(Provider, u16)> {
        use Payload::*;
        Some(match self {
            DxgiPresentStart { .. } => (Provider::Dxgi, dxgi::PRESENT_START),
            DxgiPresentStop { .. } => (Provider::Dxgi, dxgi::PRESENT_STOP),
            DxgiPresentMpoStart { .. } => (Provider::Dxgi, dxgi::PRESENT_MPO_START),
            DxgiPresentMpoStop { .. } => (Provider::Dxgi, dxgi::PRESENT_MPO_STOP),
            D3d9PresentStart { .. } => (Provider::D3d9, d3d9::PRESENT_START),
            D3d9PresentStop { .. } => (Provider::D3d9, d3d9::PRESENT_STOP),
            DxgkBlit { .. } => (Provider::DxgKrnl, dxgkrnl::BLIT),
            DxgkBlitCancel => (Provider::DxgKrnl, dxgkrnl::BLIT_CANCEL),
            DxgkFlip { .. } => (Provider::DxgKrnl, dxgkrnl::FLIP),
            DxgkFlipMpo => (Provider::DxgKrnl, dxgkrnl::FLIP_MPO),
            DxgkQueueSubmit { .. } => (Provider::DxgKrnl, dxgkrnl::QUEUE_PACKET_START),
            DxgkQueueComplete { .. } => (Provider::DxgKrnl, dxgkrnl::QUEUE_PACKET_STOP),
            DxgkMmioFlip { .. } => (Provider::DxgKrnl, dxgkrnl::MMIO_FLIP),
            DxgkMmioFlipMpo { .. } => (Provider::DxgKrnl, dxgkrnl::MMIO_FLIP_MPO),
            DxgkVSyncDpc { .. } => (Provider::DxgKrnl, dxgkrnl::VSYNC_DPC),
            DxgkVSyncDpcMpo { .. } => (Provider::DxgKrnl, dxgkrnl::VSYNC_DPC_MPO),
            DxgkHSyncDpcMpo { .. } => (Provider::DxgKrnl, dxgkrnl::HSYNC_DPC_MPO),
            DxgkPresent { .. } => (Provider::DxgKrnl, dxgkrnl::PRESENT),
            DxgkPresentHistoryStart { .. } => (Provider::DxgKrnl, dxgkrnl::PRESENT_HISTORY_START),
            DxgkPresentHistoryDetailed { .. } => {
                (Provider::DxgKrnl, dxgkrnl::PRESENT_HISTORY_DETAILED)
            }
            DxgkPresentHistoryInfo { .. } => (Provider::DxgKrnl, dxgkrnl::PRESENT_HISTORY_INFO),
            DxgkIndependentFlip { .. } => (Provider::DxgKrnl, dxgkrnl::INDEPENDENT_FLIP),
            Win32kTokenCompositionSurface { .. } => {
                (Provider::Win32k, win32k::TOKEN_COMPOSITION_SURFACE_OBJECT)
            }
            Win32kTokenStateChanged { .. } => (Provider::Win32k, win32k::TOKEN_STATE_CHANGED),
            DwmSchedulePresent => (Provider::DwmCore, dwm::SCHEDULE_PRESENT_START),
            DwmGetPresentHistory => (Provider::DwmCore, dwm::GET_PRESENT_HISTORY),
            DwmFlipChain { event, .. } => {
                let id = match event {
                    FlipChainEvent::Pending => dwm::FLIP_CHAIN_PENDING,
                    FlipChainEvent::Complete => dwm::FLIP_CHAIN_COMPLETE,
                    FlipChainEvent::Dirty => dwm::FLIP_CHAIN_DIRTY,
                };
                (Provider::DwmCore, id)
            }
            ProcessStart { .. } => (Provider::NtProcess, nt_process::START),
            ProcessStop { .. } => (Provider::NtProcess, nt_process::STOP),
            Unknown => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_identity() {
        let payload = Payload::DxgkVSyncDpc { submit_sequence: 7 };
        assert_eq!(payload.identity(), Some((Provider::DxgKrnl, 0x0011)));

        let payload = Payload::DwmFlipChain {
            event: FlipChainEvent::Dirty,
            flip_chain_id: 1,
            serial_number: 2,
            hwnd: 3,
        };
        assert_eq!(payload.identity(), Some((Provider::DwmCore, 101)));

        assert_eq!(Payload::Unknown.identity(), None);
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = Event {
            header: EventHeader { qpc: 100, pid: 10, tid: 1 },
            payload: Payload::DxgiPresentStart { swapchain: 0xA, flags: 0, sync_interval: 1 },
        };
        let line = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }
}
