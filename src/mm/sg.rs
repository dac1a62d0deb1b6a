// ============================================================================
// src/mm/sg.rs - Scatter-Gather Table Builder
// ============================================================================
//!
//! ピン留めページ列からScatter-Gatherテーブルを構築する。
//!
//! ## アルゴリズム
//! ```text
//! pages:    [P0][P1][P2]   [P7][P8]
//!            \______/       \___/
//! segments: (P0, 3 pages)  (P7, 2 pages - 末尾切り詰め)
//! ```
//! - ページ順に走査し、物理的に連続する隣接ページを1セグメントに結合
//! - 最終セグメントを切り詰め、合計長を要求長に一致させる
//! - セグメント順は入力ページ順と同じ（デバイスは順に読む）

use alloc::vec::Vec;

use crate::config::DEFAULT_MAX_SEGMENT_LEN;
use crate::error::SgError;
use crate::mm::pin::{PinnedPage, PAGE_SIZE};

/// Scatter-Gatherセグメント
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// デバイスから見えるアドレス
    pub dma_addr: u64,
    /// バイト長
    pub len: u32,
}

impl Segment {
    /// セグメント終端（排他的）
    pub fn end(&self) -> u64 {
        self.dma_addr + self.len as u64
    }
}

/// Scatter-Gatherテーブル
///
/// セグメントは隙間も重なりもなく `total_len` バイトを覆う。
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScatterGatherTable {
    segments: Vec<Segment>,
    total_len: usize,
}

impl ScatterGatherTable {
    /// 空テーブル
    pub const fn empty() -> Self {
        Self {
            segments: Vec::new(),
            total_len: 0,
        }
    }

    /// セグメント数
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// 覆っているバイト数
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// セグメントのスライスを取得
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    /// 先頭バイトのデバイスアドレス
    pub fn first_dma_addr(&self) -> Option<u64> {
        self.segments.first().map(|s| s.dma_addr)
    }

    /// バイトオフセットに対応するデバイスアドレス
    pub fn dma_addr_at(&self, offset: usize) -> Option<u64> {
        let mut base = 0usize;
        for seg in &self.segments {
            let len = seg.len as usize;
            if offset < base + len {
                return Some(seg.dma_addr + (offset - base) as u64);
            }
            base += len;
        }
        None
    }
}

impl<'a> IntoIterator for &'a ScatterGatherTable {
    type Item = &'a Segment;
    type IntoIter = core::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Scatter-Gatherテーブルビルダー
#[derive(Debug, Clone, Copy)]
pub struct SgBuilder {
    max_segment_len: u32,
    max_segments: usize,
}

impl SgBuilder {
    /// セグメント長上限を指定して作成
    ///
    /// 上限はページ境界に切り下げ、最低1ページ。
    pub const fn new(max_segment_len: u32) -> Self {
        let aligned = max_segment_len & !(PAGE_SIZE as u32 - 1);
        let max_segment_len = if aligned < PAGE_SIZE as u32 {
            PAGE_SIZE as u32
        } else {
            aligned
        };
        Self {
            max_segment_len,
            max_segments: usize::MAX,
        }
    }

    /// セグメント数の上限を設定
    pub const fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments;
        self
    }

    pub fn max_segment_len(&self) -> u32 {
        self.max_segment_len
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// テーブルを構築
    ///
    /// `total_len` がページ容量を超える場合は `InvalidLength`。部分的なテーブルは返さない。
    pub fn build(
        &self,
        pages: &[PinnedPage],
        total_len: usize,
    ) -> Result<ScatterGatherTable, SgError> {
        let capacity = pages.len() * PAGE_SIZE;
        if total_len > capacity {
            return Err(SgError::InvalidLength {
                requested: total_len,
                capacity,
            });
        }
        if total_len == 0 {
            return Ok(ScatterGatherTable::empty());
        }

        let needed = total_len.div_ceil(PAGE_SIZE);
        let pages = &pages[..needed];

        let count = count_segments(pages, self.max_segment_len);
        if count > self.max_segments {
            return Err(SgError::TooManySegments {
                segments: count,
                limit: self.max_segments,
            });
        }

        let mut segments: Vec<Segment> = Vec::new();
        segments
            .try_reserve_exact(count)
            .map_err(|_| SgError::OutOfMemory)?;

        let mut remaining = total_len;
        for page in pages {
            let chunk = remaining.min(PAGE_SIZE) as u32;
            let phys = page.phys.as_u64();

            match segments.last_mut() {
                Some(last)
                    if last.end() == phys
                        && last
                            .len
                            .checked_add(chunk)
                            .is_some_and(|len| len <= self.max_segment_len) =>
                {
                    last.len += chunk;
                }
                _ => segments.push(Segment {
                    dma_addr: phys,
                    len: chunk,
                }),
            }
            remaining -= chunk as usize;
        }

        debug_assert_eq!(remaining, 0);
        Ok(ScatterGatherTable {
            segments,
            total_len,
        })
    }

    /// テーブルを解放
    ///
    /// 純粋なメモリ解放のみ。ページのピン留めは解除しない。
    pub fn release(&self, table: ScatterGatherTable) {
        drop(table);
    }
}

impl Default for SgBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEGMENT_LEN)
    }
}

/// 全ページ分のセグメント数を事前に数える
fn count_segments(pages: &[PinnedPage], max_segment_len: u32) -> usize {
    let mut count = 0;
    let mut run_end = None;
    let mut run_len = 0u32;
    for page in pages {
        let phys = page.phys.as_u64();
        let fits = run_len
            .checked_add(PAGE_SIZE as u32)
            .is_some_and(|len| len <= max_segment_len);
        if run_end == Some(phys) && fits {
            run_len += PAGE_SIZE as u32;
        } else {
            count += 1;
            run_len = PAGE_SIZE as u32;
        }
        run_end = Some(phys + PAGE_SIZE as u64);
    }
    count
}
