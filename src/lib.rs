// ============================================================================
// src/lib.rs - NPU Buffer-Object DMA Mapping Core
// ============================================================================
//!
//! AI-engine (NPU) デバイスドライバのメモリ管理コア。
//!
//! バッファオブジェクト (BO) のホストメモリをデバイスから見えるようにする。
//! アドレッシングモードはプローブ時に一度だけ決定される:
//!
//! - **Translated**: IOMMU が PASID 単位でアドレス変換を行う
//! - **Bypass**: デバイスは物理アドレスを直接参照する。ページをピン留めし、
//!   Scatter-Gather テーブルを構築してデバイスに登録する
//!
//! ## データフロー
//! ```text
//! BO作成 -> map() -> Device::addressing_mode()
//!    (Bypass)     PagePinner -> SgBuilder -> SegmentProgrammer
//!    (Translated) IommuOps::attach_range
//! BO破棄 -> unmap() -> map時と逆順に解放
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod mm;
pub mod sim;

#[doc(hidden)]
pub use log as __log;

pub use config::DriverConfig;
pub use device::{Device, DeviceInfo, DeviceType, FirmwareVersion, MappingStats};
pub use error::{
    DriverError, DriverResult, MappingError, ModeError, PinError, RegistrationError, SgError,
};
pub use io::dma::{map, unmap, MappingHandle, MappingState};
pub use io::iommu::{AddressingMode, Pasid, RequestedMode};
pub use io::traits::{AttributeTree, DevicePlatform, IommuOps, PinOps, SegmentProgrammer};
pub use mm::bo::{BoFlags, BoId, BufferObject};
pub use mm::pin::{PagePinner, PinnedPage, PinnedPages, UserRange, PAGE_SIZE};
pub use mm::sg::{ScatterGatherTable, Segment, SgBuilder};
