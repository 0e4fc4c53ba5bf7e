//! Identity of the trace providers and events the engine recognizes.
//!
//! Event ids mirror the host OS's published manifests for the graphics
//! kernel, the presentation runtimes, the compositor, and the windowing
//! subsystem. The legacy (Win7-era) kernel providers split the same events
//! across several provider GUIDs; the decoder maps them onto the same typed
//! payloads, so they need no separate identity here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// Microsoft-Windows-DXGI {CA11C036-0102-4A2D-A6AD-F03CFED5D3C9}
    Dxgi,
    /// Microsoft-Windows-D3D9 {783ACA0A-790E-4D7F-8451-AA850511C6B9}
    D3d9,
    /// Microsoft-Windows-DxgKrnl {802EC45A-1E99-4B83-9920-87C98277BA9D}
    DxgKrnl,
    /// Microsoft-Windows-Win32k {8C416C79-D49B-4F01-A467-E56D3AA8234C}
    Win32k,
    /// Microsoft-Windows-Dwm-Core {9E9BBA3C-2E38-40CB-99F4-9E8281425164}
    DwmCore,
    /// NT kernel process provider {3D6FA8D0-FE05-11D0-9DDA-00C04FD7BA7C}
    NtProcess,
}

pub mod dxgi {
    pub const PRESENT_START: u16 = 42;
    pub const PRESENT_STOP: u16 = 43;
    pub const PRESENT_MPO_START: u16 = 55;
    pub const PRESENT_MPO_STOP: u16 = 56;
}

pub mod d3d9 {
    pub const PRESENT_START: u16 = 1;
    pub const PRESENT_STOP: u16 = 2;
}

pub mod dxgkrnl {
    pub const VSYNC_DPC: u16 = 0x0011;
    pub const MMIO_FLIP: u16 = 0x0074;
    pub const BLIT: u16 = 0x00a6;
    pub const FLIP: u16 = 0x00a8;
    pub const PRESENT_HISTORY_START: u16 = 0x00ab;
    pub const PRESENT_HISTORY_INFO: u16 = 0x00ac;
    pub const QUEUE_PACKET_START: u16 = 0x00b2;
    pub const QUEUE_PACKET_STOP: u16 = 0x00b4;
    pub const PRESENT: u16 = 0x00b8;
    pub const PRESENT_HISTORY_DETAILED: u16 = 0x00d7;
    pub const FLIP_MPO: u16 = 0x00fc;
    pub const MMIO_FLIP_MPO: u16 = 0x0103;
    pub const INDEPENDENT_FLIP: u16 = 0x010a;
    pub const VSYNC_DPC_MPO: u16 = 0x0111;
    pub const HSYNC_DPC_MPO: u16 = 0x017e;
    pub const BLIT_CANCEL: u16 = 0x01f5;
}

pub mod win32k {
    pub const TOKEN_COMPOSITION_SURFACE_OBJECT: u16 = 201;
    pub const TOKEN_STATE_CHANGED: u16 = 301;
}

pub mod dwm {
    pub const SCHEDULE_PRESENT_START: u16 = 15;
    pub const GET_PRESENT_HISTORY: u16 = 64;
    pub const FLIP_CHAIN_PENDING: u16 = 69;
    pub const FLIP_CHAIN_COMPLETE: u16 = 70;
    pub const FLIP_CHAIN_DIRTY: u16 = 101;
}

pub mod nt_process {
    pub const START: u16 = 1;
    pub const STOP: u16 = 2;
}

// DXGI present flags observed on runtime present start.
pub const DXGI_PRESENT_TEST: u32 = 0x0000_0001;
pub const DXGI_PRESENT_DO_NOT_SEQUENCE: u32 = 0x0000_0002;

// DXGI status codes observed on runtime present stop. A present that returns
// one of these never entered the presentation pipeline.
pub const DXGI_STATUS_OCCLUDED: u32 = 0x087A_0001;
pub const DXGI_STATUS_NO_DESKTOP_ACCESS: u32 = 0x087A_0005;
pub const DXGI_STATUS_MODE_CHANGE_IN_PROGRESS: u32 = 0x087A_0008;

// Flags on the kernel's set-source-address (mmio flip) event.
pub const SET_VIDPN_FLAG_MODE_CHANGE: u32 = 0x1;
pub const SET_VIDPN_FLAG_FLIP_IMMEDIATE: u32 = 0x2;
pub const SET_VIDPN_FLAG_FLIP_ON_NEXT_VSYNC: u32 = 0x4;

/// Queue packet types carried by the kernel's queue-submit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePacketType {
    RenderCommandBuffer = 0,
    DeferredCommandBuffer = 1,
    SystemCommandBuffer = 2,
    MmioFlipCommandBuffer = 3,
    WaitCommandBuffer = 4,
    SignalCommandBuffer = 5,
    DeviceCommandBuffer = 6,
    SoftwareCommandBuffer = 7,
    PagingCommandBuffer = 8,
}

/// Flip-entry status reported by the multi-plane-overlay mmio flip event.
/// Anything other than a vsync/hsync wait means the flip will not wait for
/// the next scanout boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipEntryStatus {
    FlipWaitVSync = 5,
    FlipWaitComplete = 11,
    FlipWaitPassive = 13,
    FlipWaitPost = 14,
    FlipWaitHSync = 15,
}

/// Present models carried by the kernel present-history events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentModel {
    Uninitialized = 0,
    RedirectedGdi = 1,
    RedirectedFlip = 2,
    RedirectedBlt = 3,
    RedirectedVistaBlt = 4,
    ScreenCaptureFence = 5,
    RedirectedGdiSysmem = 6,
    RedirectedComposition = 7,
    SurfaceComplete = 8,
}

/// States of a windowing composition token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Completed = 3,
    InFrame = 4,
    Confirmed = 5,
    Retired = 6,
    Discarded = 7,
}

/// Which flip-chain notification the compositor emitted. All three carry the
/// same correlation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipChainEvent {
    Pending,
    Complete,
    Dirty,
}
