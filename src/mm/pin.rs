// ============================================================================
// src/mm/pin.rs - User Page Pinning
// ============================================================================
//!
//! ユーザー仮想範囲の物理ページをピン留めする。
//!
//! - 全ページ成功か、全ページ解放のどちらか（部分ピンは残さない）
//! - デバイス単位のクォータをアトミックな予約で管理
//! - ピン留め数はいつでも観測可能

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::{PhysAddr, VirtAddr};

use crate::error::PinError;
use crate::io::traits::PinOps;

/// 4KiB ページサイズ
pub const PAGE_SIZE: usize = 4096;

/// ユーザー空間の上端（排他的）。これ以上はカーネル領域
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

// ============================================================================
// 型安全性: ユーザー仮想範囲
// ============================================================================

/// 検証済みのユーザー仮想範囲
///
/// 開始アドレスはページ境界、長さは非ゼロ、範囲全体が下位半分（ユーザー空間）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRange {
    start: VirtAddr,
    len: usize,
}

impl UserRange {
    /// 範囲を検証して作成
    pub fn new(start: u64, len: usize) -> Result<Self, PinError> {
        if len == 0 || start % PAGE_SIZE as u64 != 0 {
            return Err(PinError::InvalidRange);
        }
        let last = start
            .checked_add(len as u64 - 1)
            .ok_or(PinError::InvalidRange)?;
        // カーネル領域とカノニカルホールは不可
        if last >= USER_SPACE_END {
            return Err(PinError::InvalidRange);
        }
        let start = VirtAddr::try_new(start).map_err(|_| PinError::InvalidRange)?;
        Ok(Self { start, len })
    }

    /// 開始アドレス
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// バイト長
    pub fn len(&self) -> usize {
        self.len
    }

    /// 常にfalse（空範囲は作成できない）
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 範囲を覆うページ数
    pub fn page_count(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE)
    }

    /// 各ページの仮想アドレスを順に返す
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        (0..self.page_count()).map(move |i| self.start + (i * PAGE_SIZE) as u64)
    }
}

// ============================================================================
// ピン留めページ
// ============================================================================

/// ピン留めされた1ページ（ページハンドル）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedPage {
    /// ユーザー仮想アドレス
    pub virt: VirtAddr,
    /// 物理アドレス
    pub phys: PhysAddr,
}

/// ピン留めページ列
///
/// 範囲順に並ぶ。`PagePinner::unpin` で空になり、二度目の解放は何もしない。
#[derive(Debug, Default)]
pub struct PinnedPages {
    pages: Vec<PinnedPage>,
}

impl PinnedPages {
    /// ページ列を取得
    pub fn as_slice(&self) -> &[PinnedPage] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// ページ列が保持できるバイト数
    pub fn capacity_bytes(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}

// ============================================================================
// Page Pinner
// ============================================================================

/// ページピナー
///
/// プラットフォームのページ単位ピン留めをまとめ、ロールバックとクォータを担う。
pub struct PagePinner {
    /// 現在ピン留め中のページ数（予約分を含む）
    pinned: AtomicUsize,
    /// ページ数の上限
    quota: usize,
}

impl PagePinner {
    /// 新しいピナーを作成
    pub const fn new(quota: usize) -> Self {
        Self {
            pinned: AtomicUsize::new(0),
            quota,
        }
    }

    /// 現在のピン留めページ数
    pub fn pinned_count(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    /// クォータ
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// 範囲内の全ページをピン留め
    ///
    /// 途中で失敗した場合、それまでにピン留めしたページを全て解放してから
    /// エラーを返す。
    pub fn pin<P: PinOps + ?Sized>(
        &self,
        ops: &P,
        range: &UserRange,
        write: bool,
    ) -> Result<PinnedPages, PinError> {
        let count = range.page_count();
        self.reserve(count)?;

        let mut pages = Vec::new();
        if pages.try_reserve_exact(count).is_err() {
            self.release(count);
            return Err(PinError::QuotaExceeded);
        }

        for virt in range.pages() {
            match ops.pin_page(virt, write) {
                Ok(phys) => pages.push(PinnedPage { virt, phys }),
                Err(e) => {
                    log::debug!(
                        "pin: {:?} failed at page {}/{}: {}",
                        virt,
                        pages.len(),
                        count,
                        e
                    );
                    for page in pages.drain(..).rev() {
                        ops.unpin_page(page);
                    }
                    self.release(count);
                    return Err(e);
                }
            }
        }

        Ok(PinnedPages { pages })
    }

    /// ピン留めを解放
    ///
    /// ページ列は空になるため、同じ列を再度渡しても何もしない。
    pub fn unpin<P: PinOps + ?Sized>(&self, ops: &P, pages: &mut PinnedPages) {
        let count = pages.pages.len();
        for page in pages.pages.drain(..) {
            ops.unpin_page(page);
        }
        self.release(count);
    }

    fn reserve(&self, count: usize) -> Result<(), PinError> {
        self.pinned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(count).filter(|&total| total <= self.quota)
            })
            .map(|_| ())
            .map_err(|_| PinError::QuotaExceeded)
    }

    fn release(&self, count: usize) {
        if count != 0 {
            self.pinned.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{PageLayout, SimPlatform};

    const BASE: u64 = 0x7f00_0000_0000;

    #[test]
    fn test_user_range_validation() {
        assert_eq!(UserRange::new(BASE, 0), Err(PinError::InvalidRange));
        assert_eq!(UserRange::new(BASE + 1, 16), Err(PinError::InvalidRange));
        assert_eq!(
            UserRange::new(0x0000_8000_0000_0000, PAGE_SIZE),
            Err(PinError::InvalidRange)
        );
        assert_eq!(
            UserRange::new(0x0000_7fff_ffff_f000, 2 * PAGE_SIZE),
            Err(PinError::InvalidRange)
        );
        // 上位半分（カーネル）はカノニカルでも不可
        assert_eq!(
            UserRange::new(0xffff_8000_0000_0000, PAGE_SIZE),
            Err(PinError::InvalidRange)
        );
        assert_eq!(
            UserRange::new(0xffff_ffff_ffff_f000, PAGE_SIZE),
            Err(PinError::InvalidRange)
        );
        assert!(UserRange::new(USER_SPACE_END - PAGE_SIZE as u64, PAGE_SIZE).is_ok());

        let range = UserRange::new(BASE, 2 * PAGE_SIZE + 1).unwrap();
        assert_eq!(range.page_count(), 3);
        let pages: Vec<u64> = range.pages().map(|v| v.as_u64()).collect();
        assert_eq!(pages, [BASE, BASE + 0x1000, BASE + 0x2000]);
    }

    #[test]
    fn test_pin_and_unpin() {
        let platform = SimPlatform::bypass_only(PageLayout::Contiguous);
        let pinner = PagePinner::new(usize::MAX);
        let range = UserRange::new(BASE, 4 * PAGE_SIZE).unwrap();

        let mut pages = pinner.pin(&platform, &range, true).unwrap();
        assert_eq!(pages.len(), 4);
        assert_eq!(pinner.pinned_count(), 4);
        assert_eq!(platform.pinned_pages(), 4);

        pinner.unpin(&platform, &mut pages);
        assert!(pages.is_empty());
        assert_eq!(pinner.pinned_count(), 0);
        assert_eq!(platform.pinned_pages(), 0);

        // 二度目は何もしない
        pinner.unpin(&platform, &mut pages);
        assert_eq!(pinner.pinned_count(), 0);
    }

    #[test]
    fn test_pin_rollback_on_failure() {
        let platform = SimPlatform::bypass_only(PageLayout::Contiguous);
        platform.fail_pin_at(BASE + 2 * PAGE_SIZE as u64);
        let pinner = PagePinner::new(usize::MAX);
        let range = UserRange::new(BASE, 4 * PAGE_SIZE).unwrap();

        assert_eq!(
            pinner.pin(&platform, &range, false).unwrap_err(),
            PinError::NotResident
        );
        assert_eq!(pinner.pinned_count(), 0);
        assert_eq!(platform.pinned_pages(), 0);
    }

    #[test]
    fn test_pin_quota() {
        let platform = SimPlatform::bypass_only(PageLayout::Contiguous);
        let pinner = PagePinner::new(3);
        let range = UserRange::new(BASE, 4 * PAGE_SIZE).unwrap();

        assert_eq!(
            pinner.pin(&platform, &range, false).unwrap_err(),
            PinError::QuotaExceeded
        );
        assert_eq!(pinner.pinned_count(), 0);
        assert_eq!(platform.pinned_pages(), 0);

        let small = UserRange::new(BASE, 3 * PAGE_SIZE).unwrap();
        let mut pages = pinner.pin(&platform, &small, false).unwrap();
        assert_eq!(pinner.pinned_count(), 3);
        pinner.unpin(&platform, &mut pages);
    }
}
