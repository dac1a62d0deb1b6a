// ============================================================================
// src/io/dma.rs - Buffer Object DMA Mapping
// ============================================================================
//!
//! # BOのDMAマッピング
//!
//! デバイスのアドレッシングモードに応じてBOをデバイスから見えるようにする。
//!
//! ## 状態遷移
//! ```text
//!              map (Translated)
//! Unmapped ----------------------> Translated { pasid, iova }
//!    ^    \    map (Bypass)
//!    |     ----------------------> Bypass { pages, table }
//!    |                                  |
//!    +-------------- unmap -------------+
//! ```
//!
//! ## Bypass の取得/解放順序
//! ```text
//! map:   pin -> build table -> program segments
//! unmap: release segments -> free table -> unpin
//! ```
//! どの段階で失敗しても、それまでに取得した資源を逆順に解放して
//! `Unmapped` のまま戻る。

use crate::device::Registration;
use crate::error::{MappingError, RegistrationError};
use crate::io::iommu::{AddressingMode, IommuError, Pasid};
use crate::io::traits::DevicePlatform;
use crate::mm::bo::{BoFlags, BoId, BufferObject};
use crate::mm::pin::PinnedPages;
use crate::mm::sg::ScatterGatherTable;
use crate::{xdna_dbg, xdna_err, xdna_warn};

// ============================================================================
// マッピング状態
// ============================================================================

/// BOごとのマッピング状態
///
/// `Bypass` はピン留めページとSGテーブルを所有する。どちらも `unmap` で
/// 解放されるまで保持される。
#[derive(Debug, Default)]
pub enum MappingState {
    /// 未マップ
    #[default]
    Unmapped,
    /// PASIDアドレス空間にアタッチ済み
    Translated { pasid: Pasid, iova: u64 },
    /// ピン留め済み、デバイスにセグメント登録済み
    Bypass {
        pages: PinnedPages,
        table: ScatterGatherTable,
    },
}

impl MappingState {
    /// 対応するアドレッシングモード（未マップならNone）
    pub fn mode(&self) -> Option<AddressingMode> {
        match self {
            MappingState::Unmapped => None,
            MappingState::Translated { .. } => Some(AddressingMode::Translated),
            MappingState::Bypass { .. } => Some(AddressingMode::Bypass),
        }
    }

    /// Bypassモードのセグメントテーブル
    pub fn table(&self) -> Option<&ScatterGatherTable> {
        match self {
            MappingState::Bypass { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// マップ結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingHandle {
    pub bo: BoId,
    pub mode: AddressingMode,
    /// 先頭バイトのデバイスアドレス (IOVA または物理アドレス)
    pub dma_addr: u64,
    /// セグメント数 (Translatedでは1)
    pub segments: usize,
    /// マップしたバイト数
    pub len: usize,
}

// ============================================================================
// Map
// ============================================================================

/// BOをデバイスにマップ
///
/// BOのロックを状態遷移が完了するまで保持する。既にマップ済みなら
/// `AlreadyMapped` を返し、状態は変更しない。
pub fn map<P: DevicePlatform>(bo: &BufferObject<'_, P>) -> Result<MappingHandle, MappingError> {
    let device = bo.device();
    let mut state = bo.state.lock();
    if !matches!(*state, MappingState::Unmapped) {
        xdna_dbg!(device, "bo {} already mapped", bo.id().0);
        return Err(MappingError::AlreadyMapped);
    }

    let (mapped, handle) = match device.addressing_mode() {
        AddressingMode::Translated => map_translated(bo)?,
        AddressingMode::Bypass => map_bypass(bo)?,
    };
    *state = mapped;

    xdna_dbg!(
        device,
        "bo {} mapped ({}): dma {:#x}, {} segments",
        handle.bo.0,
        handle.mode,
        handle.dma_addr,
        handle.segments
    );
    Ok(handle)
}

fn map_translated<P: DevicePlatform>(
    bo: &BufferObject<'_, P>,
) -> Result<(MappingState, MappingHandle), MappingError> {
    let device = bo.device();
    let attach_failed =
        |e: IommuError| MappingError::DeviceRegistrationFailure(RegistrationError::Attach(e));

    let pasid = device
        .pasid()
        .ok_or(attach_failed(IommuError::InvalidPasid))?;
    let iova = device
        .platform()
        .attach_range(pasid, bo.range(), bo.flags())
        .map_err(|e| {
            xdna_err!(device, "bo {}: PASID {} attach failed: {}", bo.id().0, pasid.0, e);
            attach_failed(e)
        })?;
    device.note_attach(bo.size());

    let handle = MappingHandle {
        bo: bo.id(),
        mode: AddressingMode::Translated,
        dma_addr: iova,
        segments: 1,
        len: bo.size(),
    };
    Ok((MappingState::Translated { pasid, iova }, handle))
}

fn map_bypass<P: DevicePlatform>(
    bo: &BufferObject<'_, P>,
) -> Result<(MappingState, MappingHandle), MappingError> {
    let device = bo.device();
    let platform = device.platform();
    let pinner = device.pinner();
    let write = bo.flags().contains(BoFlags::DEVICE_WRITE);

    let mut pages = pinner.pin(platform, bo.range(), write).map_err(|e| {
        xdna_err!(device, "bo {}: pin pages failed: {}", bo.id().0, e);
        e
    })?;

    let table = match device.sg_builder().build(pages.as_slice(), bo.size()) {
        Ok(table) => table,
        Err(e) => {
            xdna_err!(device, "bo {}: build sg table failed: {}", bo.id().0, e);
            pinner.unpin(platform, &mut pages);
            return Err(e.into());
        }
    };

    if let Err(e) = platform.program_segments(bo.id(), &table) {
        xdna_err!(device, "bo {}: program segments failed: {}", bo.id().0, e);
        device.sg_builder().release(table);
        pinner.unpin(platform, &mut pages);
        return Err(e.into());
    }

    // テーブルは空にならない（BOの長さは非ゼロ）
    let dma_addr = table.first_dma_addr().unwrap_or_default();
    device.insert_registration(
        bo.id(),
        Registration {
            segments: table.len(),
            bytes: table.total_len(),
            dma_addr,
        },
    );

    let handle = MappingHandle {
        bo: bo.id(),
        mode: AddressingMode::Bypass,
        dma_addr,
        segments: table.len(),
        len: table.total_len(),
    };
    Ok((MappingState::Bypass { pages, table }, handle))
}

// ============================================================================
// Unmap
// ============================================================================

/// BOのマップを解除
///
/// 冪等。未マップなら何もしない。エラーは返さず、解除に失敗した
/// プラットフォーム操作はログに残す。
pub fn unmap<P: DevicePlatform>(bo: &BufferObject<'_, P>) {
    let device = bo.device();
    let mut state = bo.state.lock();

    match core::mem::take(&mut *state) {
        MappingState::Unmapped => {}
        MappingState::Translated { pasid, iova } => {
            if let Err(e) = device.platform().detach_range(pasid, bo.range()) {
                xdna_warn!(
                    device,
                    "bo {}: detach iova {:#x} from PASID {} failed: {}",
                    bo.id().0,
                    iova,
                    pasid.0,
                    e
                );
            }
            device.note_detach(bo.size());
            xdna_dbg!(device, "bo {} unmapped (translated)", bo.id().0);
        }
        MappingState::Bypass { mut pages, table } => {
            // デバイス側の登録を先に外してからページを解放する
            device.platform().release_segments(bo.id());
            device.remove_registration(bo.id());
            device.sg_builder().release(table);
            device.pinner().unpin(device.platform(), &mut pages);
            xdna_dbg!(device, "bo {} unmapped (bypass)", bo.id().0);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::{Device, DeviceInfo, DeviceType, FirmwareVersion, MappingStats};
    use crate::error::{PinError, SgError};
    use crate::mm::pin::{UserRange, PAGE_SIZE};
    use crate::mm::sg::Segment;
    use crate::sim::{PageLayout, SimEvent, SimPlatform};

    const BASE: u64 = 0x7f00_0000_0000;

    fn probe(platform: SimPlatform, params: &str) -> Device<SimPlatform> {
        Device::probe(
            platform,
            DeviceInfo::new("npu0", DeviceType::Kmq, "RyzenAI-npu1"),
            FirmwareVersion::new(1, 0, 0, 0),
            DriverConfig::parse(params).unwrap(),
        )
        .unwrap()
    }

    fn bypass_device(layout: PageLayout) -> Device<SimPlatform> {
        probe(SimPlatform::bypass_only(layout), "")
    }

    fn range(pages: usize) -> UserRange {
        UserRange::new(BASE, pages * PAGE_SIZE).unwrap()
    }

    #[test]
    fn test_bypass_contiguous_single_segment() {
        let device = bypass_device(PageLayout::Contiguous);
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        let handle = bo.map().unwrap();
        assert_eq!(handle.mode, AddressingMode::Bypass);
        assert_eq!(handle.segments, 1);
        assert_eq!(handle.len, 4 * PAGE_SIZE);

        bo.with_state(|state| {
            let table = state.table().unwrap();
            assert_eq!(
                table.segments(),
                [Segment {
                    dma_addr: handle.dma_addr,
                    len: 4 * PAGE_SIZE as u32,
                }]
            );
        });
        assert_eq!(device.platform().pinned_pages(), 4);
        assert_eq!(device.registration(bo.id()).unwrap().segments, 1);
        assert_eq!(device.platform().programmed(bo.id()).unwrap().len(), 1);
    }

    #[test]
    fn test_bypass_scattered_segments_in_order() {
        let device = bypass_device(PageLayout::Scattered);
        let bo = BufferObject::new(&device, range(3), BoFlags::RW);

        let handle = bo.map().unwrap();
        assert_eq!(handle.segments, 3);
        bo.with_state(|state| {
            let table = state.table().unwrap();
            let addrs: Vec<u64> = table.iter().map(|s| s.dma_addr).collect();
            assert!(addrs.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(table.total_len(), 3 * PAGE_SIZE);
        });
    }

    #[test]
    fn test_partial_last_page_truncated() {
        let device = bypass_device(PageLayout::Chunked(2));
        let bo = BufferObject::new(
            &device,
            UserRange::new(BASE, 2 * PAGE_SIZE + 10).unwrap(),
            BoFlags::RW,
        );

        let handle = bo.map().unwrap();
        assert_eq!(handle.segments, 2);
        assert_eq!(handle.len, 2 * PAGE_SIZE + 10);
        bo.with_state(|state| {
            let lens: Vec<u32> = state.table().unwrap().iter().map(|s| s.len).collect();
            assert_eq!(lens, [2 * PAGE_SIZE as u32, 10]);
        });
        assert_eq!(device.platform().pinned_pages(), 3);
    }

    #[test]
    fn test_double_map_rejected() {
        let device = bypass_device(PageLayout::Contiguous);
        let bo = BufferObject::new(&device, range(2), BoFlags::RW);

        let first = bo.map().unwrap();
        assert_eq!(bo.map(), Err(MappingError::AlreadyMapped));
        assert_eq!(device.platform().pinned_pages(), 2);
        assert_eq!(device.registration(bo.id()).unwrap().dma_addr, first.dma_addr);
    }

    #[test]
    fn test_unmap_idempotent() {
        let device = bypass_device(PageLayout::Contiguous);
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        bo.unmap();
        bo.map().unwrap();
        bo.unmap();
        assert!(!bo.is_mapped());
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.registration(bo.id()), None);
        assert_eq!(device.stats(), MappingStats::default());

        bo.unmap();
        assert_eq!(device.pinner().pinned_count(), 0);

        // 再マップ可能
        bo.map().unwrap();
        assert!(bo.is_mapped());
    }

    #[test]
    fn test_pin_failure_rolls_back() {
        let device = bypass_device(PageLayout::Contiguous);
        device.platform().fail_pin_at(BASE + 3 * PAGE_SIZE as u64);
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        assert_eq!(
            bo.map(),
            Err(MappingError::PinFailure(PinError::NotResident))
        );
        assert!(!bo.is_mapped());
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.platform().programmed_tables(), 0);

        device.platform().clear_failures();
        bo.map().unwrap();
    }

    #[test]
    fn test_program_failure_rolls_back() {
        let device = bypass_device(PageLayout::Scattered);
        device.platform().fail_program(true);
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        assert_eq!(
            bo.map(),
            Err(MappingError::DeviceRegistrationFailure(
                RegistrationError::Rejected
            ))
        );
        assert!(!bo.is_mapped());
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.pinner().pinned_count(), 0);
        assert_eq!(device.registration(bo.id()), None);
    }

    #[test]
    fn test_table_build_failure_rolls_back() {
        let device = probe(
            SimPlatform::bypass_only(PageLayout::Scattered),
            "max_segments=2",
        );
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        assert_eq!(
            bo.map(),
            Err(MappingError::TableBuildFailure(SgError::TooManySegments {
                segments: 4,
                limit: 2,
            }))
        );
        assert!(!bo.is_mapped());
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.pinner().pinned_count(), 0);
        assert_eq!(device.platform().programmed_tables(), 0);
        assert_eq!(device.stats(), MappingStats::default());

        // 上限内のBOはマップできる
        let small = BufferObject::new(
            &device,
            UserRange::new(BASE + 0x10_0000, 2 * PAGE_SIZE).unwrap(),
            BoFlags::RW,
        );
        assert_eq!(small.map().unwrap().segments, 2);
    }

    #[test]
    fn test_quota_exceeded() {
        let device = probe(
            SimPlatform::bypass_only(PageLayout::Contiguous),
            "max_pinned_pages=4",
        );
        let a = BufferObject::new(&device, range(3), BoFlags::RW);
        let b = BufferObject::new(
            &device,
            UserRange::new(BASE + 0x10_0000, 2 * PAGE_SIZE).unwrap(),
            BoFlags::RW,
        );

        a.map().unwrap();
        assert_eq!(
            b.map(),
            Err(MappingError::PinFailure(PinError::QuotaExceeded))
        );
        a.unmap();
        b.map().unwrap();
    }

    #[test]
    fn test_teardown_releases_registration_before_unpin() {
        let device = bypass_device(PageLayout::Contiguous);
        let bo = BufferObject::new(&device, range(2), BoFlags::RW);
        bo.map().unwrap();
        device.platform().clear_events();

        bo.unmap();
        let events = device.platform().events();
        let release = events
            .iter()
            .position(|e| *e == SimEvent::Release(bo.id()))
            .unwrap();
        let first_unpin = events
            .iter()
            .position(|e| matches!(e, SimEvent::Unpin(_)))
            .unwrap();
        assert!(release < first_unpin);
    }

    #[test]
    fn test_write_intent_follows_flags() {
        let device = bypass_device(PageLayout::Contiguous);
        let ro = BufferObject::new(&device, range(1), BoFlags::DEVICE_READ);
        ro.map().unwrap();
        assert!(device
            .platform()
            .events()
            .contains(&SimEvent::Pin { virt: BASE, write: false }));

        let rw = BufferObject::new(
            &device,
            UserRange::new(BASE + 0x10_0000, PAGE_SIZE).unwrap(),
            BoFlags::RW,
        );
        rw.map().unwrap();
        assert!(device.platform().events().contains(&SimEvent::Pin {
            virt: BASE + 0x10_0000,
            write: true,
        }));
    }

    #[test]
    fn test_drop_unmaps() {
        let device = bypass_device(PageLayout::Contiguous);
        {
            let bo = BufferObject::new(&device, range(4), BoFlags::RW);
            bo.map().unwrap();
            assert_eq!(device.stats().registrations, 1);
        }
        assert_eq!(device.stats(), MappingStats::default());
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.platform().programmed_tables(), 0);
    }

    #[test]
    fn test_translated_map_attaches_without_pinning() {
        let device = probe(SimPlatform::with_iommu(PageLayout::Contiguous), "");
        assert_eq!(device.addressing_mode(), AddressingMode::Translated);
        let bo = BufferObject::new(&device, range(4), BoFlags::RW);

        let handle = bo.map().unwrap();
        assert_eq!(handle.mode, AddressingMode::Translated);
        assert_eq!(handle.dma_addr, BASE);
        assert_eq!(handle.segments, 1);
        assert_eq!(device.platform().pinned_pages(), 0);
        assert_eq!(device.platform().attached_ranges(), 1);
        assert_eq!(device.stats().translated_attaches, 1);
        assert_eq!(bo.with_state(|s| s.mode()), Some(AddressingMode::Translated));

        bo.unmap();
        assert_eq!(device.platform().attached_ranges(), 0);
        assert_eq!(device.stats().translated_attaches, 0);
    }

    #[test]
    fn test_translated_attach_failure() {
        let device = probe(SimPlatform::with_iommu(PageLayout::Contiguous), "");
        device.platform().fail_attach(true);
        let bo = BufferObject::new(&device, range(1), BoFlags::RW);

        assert_eq!(
            bo.map(),
            Err(MappingError::DeviceRegistrationFailure(
                RegistrationError::Attach(IommuError::HardwareError)
            ))
        );
        assert!(!bo.is_mapped());
        assert_eq!(device.stats().translated_attaches, 0);
    }

    #[test]
    fn test_forced_bypass_on_iommu_platform() {
        let device = probe(SimPlatform::with_iommu(PageLayout::Contiguous), "iommu_mode=1");
        assert_eq!(device.addressing_mode(), AddressingMode::Bypass);
        assert_eq!(device.pasid(), None);

        let bo = BufferObject::new(&device, range(2), BoFlags::RW);
        assert_eq!(bo.map().unwrap().mode, AddressingMode::Bypass);
        assert_eq!(device.platform().attached_ranges(), 0);
    }

    #[test]
    fn test_segment_limit_from_config() {
        let device = probe(
            SimPlatform::bypass_only(PageLayout::Contiguous),
            "max_segment_len=0x2000",
        );
        let bo = BufferObject::new(&device, range(5), BoFlags::RW);
        assert_eq!(bo.map().unwrap().segments, 3);
    }
}
