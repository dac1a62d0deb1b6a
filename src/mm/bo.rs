// ============================================================================
// src/mm/bo.rs - Buffer Object
// ============================================================================
//!
//! バッファオブジェクト (BO)
//!
//! デバイスがアクセスし得るホストメモリ領域を表す。BOはアロケーション層が所有し、
//! `Device` へは参照のみ持つ（モードとプラットフォーム能力を知るため）。
//!
//! マッピング状態は BO ごとの `spin::Mutex` で保護され、状態遷移の間は
//! ロックを保持し続ける。

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::device::Device;
use crate::error::MappingError;
use crate::io::dma::{self, MappingHandle, MappingState};
use crate::io::traits::DevicePlatform;
use crate::mm::pin::UserRange;

bitflags! {
    /// デバイスアクセスフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoFlags: u32 {
        /// デバイスが読み取る
        const DEVICE_READ = 1 << 0;
        /// デバイスが書き込む（書き込み意図でピン留め）
        const DEVICE_WRITE = 1 << 1;

        /// 読み書き
        const RW = Self::DEVICE_READ.bits() | Self::DEVICE_WRITE.bits();
    }
}

impl Default for BoFlags {
    fn default() -> Self {
        Self::RW
    }
}

/// BO識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(pub u64);

static NEXT_BO_ID: AtomicU64 = AtomicU64::new(1);

impl BoId {
    fn next() -> Self {
        Self(NEXT_BO_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// バッファオブジェクト
pub struct BufferObject<'d, P: DevicePlatform> {
    id: BoId,
    device: &'d Device<P>,
    range: UserRange,
    flags: BoFlags,
    pub(crate) state: Mutex<MappingState>,
}

impl<'d, P: DevicePlatform> BufferObject<'d, P> {
    /// ユーザー範囲を背後に持つBOを作成（未マップ状態）
    pub fn new(device: &'d Device<P>, range: UserRange, flags: BoFlags) -> Self {
        Self {
            id: BoId::next(),
            device,
            range,
            flags,
            state: Mutex::new(MappingState::Unmapped),
        }
    }

    pub fn id(&self) -> BoId {
        self.id
    }

    pub fn device(&self) -> &'d Device<P> {
        self.device
    }

    /// 背後のユーザー範囲
    pub fn range(&self) -> &UserRange {
        &self.range
    }

    /// バイトサイズ
    pub fn size(&self) -> usize {
        self.range.len()
    }

    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// デバイスにマップ
    pub fn map(&self) -> Result<MappingHandle, MappingError> {
        dma::map(self)
    }

    /// マップ解除（冪等）
    pub fn unmap(&self) {
        dma::unmap(self)
    }

    /// 現在マップ済みか
    pub fn is_mapped(&self) -> bool {
        !matches!(*self.state.lock(), MappingState::Unmapped)
    }

    /// 状態を参照してクロージャを実行
    pub fn with_state<R>(&self, f: impl FnOnce(&MappingState) -> R) -> R {
        f(&*self.state.lock())
    }
}

impl<P: DevicePlatform> Drop for BufferObject<'_, P> {
    fn drop(&mut self) {
        // 破棄経路では常にマップ解除（未マップなら何もしない）
        dma::unmap(self);
    }
}

impl<P: DevicePlatform> core::fmt::Debug for BufferObject<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
