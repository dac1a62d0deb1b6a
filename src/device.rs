// ============================================================================
// src/device.rs - NPU Device Instance
// ============================================================================
//!
//! デバイスインスタンス
//!
//! プローブ時に作成され、アドレッシングモードを一度だけ選択して不変フィールドとして
//! 保持する。BOはこの値を参照してモードとプラットフォーム能力を知る。
//!
//! ## ライフサイクル
//! ```text
//! probe: select_mode -> sysfs::init -> (BO map/unmap ...)
//! drop:  sysfs::fini -> leak report -> free_pasid
//! ```

use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::io::iommu::{self, AddressingMode, Pasid};
use crate::io::sysfs;
use crate::io::traits::DevicePlatform;
use crate::mm::bo::BoId;
use crate::mm::pin::PagePinner;
use crate::mm::sg::SgBuilder;
use crate::{xdna_info, xdna_warn};

// ============================================================================
// Device Identity
// ============================================================================

/// デバイス種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceType {
    Unknown = -1,
    /// カーネルモードキュー
    Kmq = 0,
    /// ユーザーモードキュー
    Umq = 1,
}

impl DeviceType {
    /// 属性として報告する数値コード
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// ファームウェアバージョン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub sub: u32,
    pub build: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, sub: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            sub,
            build,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.sub, self.build)
    }
}

/// デバイス識別情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// ログに前置するデバイス名
    pub name: String,
    pub device_type: DeviceType,
    /// ボード名/バージョン文字列
    pub vbnv: String,
}

impl DeviceInfo {
    pub fn new(name: &str, device_type: DeviceType, vbnv: &str) -> Self {
        Self {
            name: String::from(name),
            device_type,
            vbnv: String::from(vbnv),
        }
    }
}

// ============================================================================
// Device-side Registration Table
// ============================================================================

/// デバイス側登録エントリ (Bypassモード)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub segments: usize,
    pub bytes: usize,
    pub dma_addr: u64,
}

/// マッピング統計スナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingStats {
    /// 生存中のセグメントテーブル登録数
    pub registrations: usize,
    /// 生存中のPASIDアタッチ数
    pub translated_attaches: usize,
    /// ピン留め中のページ数
    pub pinned_pages: usize,
    /// マップ済みバイト数
    pub mapped_bytes: usize,
}

// ============================================================================
// Device
// ============================================================================

/// NPUデバイス
pub struct Device<P: DevicePlatform> {
    info: DeviceInfo,
    fw_version: FirmwareVersion,
    config: DriverConfig,
    /// プローブ時に一度だけ設定
    mode: AddressingMode,
    pasid: Option<Pasid>,
    platform: P,
    pinner: PagePinner,
    sg: SgBuilder,
    /// BOロック保持中にのみ変更される
    registrations: Mutex<HashMap<BoId, Registration>>,
    attaches: AtomicUsize,
    attached_bytes: AtomicUsize,
    sysfs_registered: bool,
}

impl<P: DevicePlatform> Device<P> {
    /// デバイスをプローブ
    ///
    /// アドレッシングモードを選択できなければ `UnsupportedMode` で起動を中止する。
    pub fn probe(
        platform: P,
        info: DeviceInfo,
        fw_version: FirmwareVersion,
        config: DriverConfig,
    ) -> DriverResult<Self> {
        config.validate()?;

        let selection = iommu::select_mode(&platform, config.iommu_mode).map_err(|e| {
            log::error!("{}: device bring-up aborted: {}", info.name, e);
            DriverError::from(e)
        })?;

        let mut device = Self {
            info,
            fw_version,
            config,
            mode: selection.mode,
            pasid: selection.pasid,
            platform,
            pinner: PagePinner::new(config.max_pinned_pages),
            sg: SgBuilder::new(config.max_segment_len).with_max_segments(config.max_segments),
            registrations: Mutex::new(HashMap::new()),
            attaches: AtomicUsize::new(0),
            attached_bytes: AtomicUsize::new(0),
            sysfs_registered: false,
        };

        match device.pasid {
            Some(pasid) => xdna_info!(device, "IOMMU mode {}, PASID {}", device.mode, pasid.0),
            None => xdna_info!(device, "IOMMU mode {}", device.mode),
        }
        if device.config.priv_load {
            xdna_info!(device, "privileged firmware load requested");
        }
        if device.config.start_col_index >= 0 {
            xdna_info!(device, "start column {}", device.config.start_col_index);
        }

        device.sysfs_registered = sysfs::init(&device);
        Ok(device)
    }

    /// アドレッシングモード（読み取り専用）
    pub fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    /// Translatedモードで確保したPASID
    pub fn pasid(&self) -> Option<Pasid> {
        self.pasid
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn fw_version(&self) -> FirmwareVersion {
        self.fw_version
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn pinner(&self) -> &PagePinner {
        &self.pinner
    }

    pub fn sg_builder(&self) -> &SgBuilder {
        &self.sg
    }

    /// 属性グループが登録済みか
    pub fn sysfs_registered(&self) -> bool {
        self.sysfs_registered
    }

    /// 登録エントリを取得
    pub fn registration(&self, bo: BoId) -> Option<Registration> {
        self.registrations.lock().get(&bo).copied()
    }

    pub(crate) fn insert_registration(&self, bo: BoId, reg: Registration) {
        self.registrations.lock().insert(bo, reg);
    }

    pub(crate) fn remove_registration(&self, bo: BoId) -> Option<Registration> {
        self.registrations.lock().remove(&bo)
    }

    pub(crate) fn note_attach(&self, bytes: usize) {
        self.attaches.fetch_add(1, Ordering::AcqRel);
        self.attached_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn note_detach(&self, bytes: usize) {
        self.attaches.fetch_sub(1, Ordering::AcqRel);
        self.attached_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// 統計スナップショット
    pub fn stats(&self) -> MappingStats {
        let regs = self.registrations.lock();
        MappingStats {
            registrations: regs.len(),
            translated_attaches: self.attaches.load(Ordering::Acquire),
            pinned_pages: self.pinner.pinned_count(),
            mapped_bytes: regs.values().map(|r| r.bytes).sum::<usize>()
                + self.attached_bytes.load(Ordering::Acquire),
        }
    }

    /// メモリマネージャの状態をダンプ
    pub fn dump_mappings(&self) {
        let stats = self.stats();
        xdna_info!(
            self,
            "mode {}: {} registrations, {} attaches, {} pinned pages, {:#x} bytes mapped",
            self.mode,
            stats.registrations,
            stats.translated_attaches,
            stats.pinned_pages,
            stats.mapped_bytes
        );
        for (bo, reg) in self.registrations.lock().iter() {
            xdna_info!(
                self,
                "  bo {}: dma {:#x}, {} segments, {:#x} bytes",
                bo.0,
                reg.dma_addr,
                reg.segments,
                reg.bytes
            );
        }
    }
}

impl<P: DevicePlatform> Drop for Device<P> {
    fn drop(&mut self) {
        if self.sysfs_registered {
            sysfs::fini(&self.platform);
        }

        let stats = self.stats();
        if stats.registrations != 0 || stats.translated_attaches != 0 || stats.pinned_pages != 0 {
            xdna_warn!(
                self,
                "removed with live mappings: {} registrations, {} attaches, {} pinned pages",
                stats.registrations,
                stats.translated_attaches,
                stats.pinned_pages
            );
        }

        if let Some(pasid) = self.pasid.take() {
            self.platform.free_pasid(pasid);
        }
    }
}

impl<P: DevicePlatform> fmt::Debug for Device<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("fw_version", &self.fw_version)
            .field("mode", &self.mode)
            .field("pasid", &self.pasid)
            .finish_non_exhaustive()
    }
}
