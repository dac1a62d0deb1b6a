// ============================================================================
// src/io/traits.rs - Platform Capability Traits
// ============================================================================
//!
//! プラットフォーム層が提供する能力のトレイト
//!
//! マッピングコアはこれらを不透明な能力として扱い、自身では実装しない:
//! - IOMMU: PASIDの確保/解放、範囲のアタッチ/デタッチ
//! - ピン留め: ユーザー仮想ページ単位のピン/アンピン
//! - セグメント登録: デバイスから見えるセグメントテーブルのプログラム/解放
//! - 属性ツリー: 読み取り専用属性グループの公開

use crate::error::{PinError, RegistrationError};
use crate::io::iommu::{IommuError, Pasid};
use crate::io::sysfs::{DeviceAttribute, SysfsError};
use crate::mm::bo::{BoFlags, BoId};
use crate::mm::pin::{PinnedPage, UserRange};
use crate::mm::sg::ScatterGatherTable;
use x86_64::{PhysAddr, VirtAddr};

// ============================================================================
// IOMMU Capability
// ============================================================================

/// IOMMU 操作トレイト
pub trait IommuOps {
    /// ホストIOMMUが存在するか
    fn iommu_present(&self) -> bool;

    /// 物理アドレスによるデバイスアクセスを許可できるか
    ///
    /// 厳格な変換ドメインに置かれている場合はfalse。
    fn supports_passthrough(&self) -> bool {
        true
    }

    /// このデバイス用のPASIDを確保
    fn alloc_pasid(&self) -> Result<Pasid, IommuError>;

    /// PASIDを解放
    fn free_pasid(&self, pasid: Pasid);

    /// ユーザー範囲をPASIDのアドレス空間にアタッチし、IOVAを返す
    fn attach_range(
        &self,
        pasid: Pasid,
        range: &UserRange,
        flags: BoFlags,
    ) -> Result<u64, IommuError>;

    /// アタッチを解除
    fn detach_range(&self, pasid: Pasid, range: &UserRange) -> Result<(), IommuError>;
}

// ============================================================================
// Pinning Capability
// ============================================================================

/// ページピン留めトレイト
pub trait PinOps {
    /// 1ページをピン留めし、物理アドレスを返す
    fn pin_page(&self, addr: VirtAddr, write: bool) -> Result<PhysAddr, PinError>;

    /// ピン留めを解放（未ピンのハンドルに対しては何もしない）
    fn unpin_page(&self, page: PinnedPage);
}

// ============================================================================
// Device Segment Programming
// ============================================================================

/// デバイス側セグメントテーブル登録トレイト
pub trait SegmentProgrammer {
    /// BOのセグメントテーブルをデバイスにプログラム
    fn program_segments(
        &self,
        bo: BoId,
        table: &ScatterGatherTable,
    ) -> Result<(), RegistrationError>;

    /// BOの登録を解除
    fn release_segments(&self, bo: BoId);
}

// ============================================================================
// Attribute Tree
// ============================================================================

/// ホストの属性ツリー（観測メカニズム）
pub trait AttributeTree {
    /// 属性グループを作成
    fn create_group(&self, group: &str, attrs: &[DeviceAttribute]) -> Result<(), SysfsError>;

    /// 属性グループを削除
    fn remove_group(&self, group: &str);
}

/// デバイスハンドル: 全能力の組
pub trait DevicePlatform: IommuOps + PinOps + SegmentProgrammer + AttributeTree {}

impl<T> DevicePlatform for T where T: IommuOps + PinOps + SegmentProgrammer + AttributeTree {}
