// ============================================================================
// src/io/iommu.rs - IOMMU Addressing Mode Selection
// ============================================================================
//!
//! IOMMU アドレッシングモード選択
//!
//! ## モード
//! - Translated: デバイスはPASIDを提示し、ホストIOMMUが変換する
//! - Bypass: デバイスは物理アドレスを直接参照する (no-PASID)
//!
//! ## 選択タイミング
//! デバイス初期化時に一度だけ `select_mode` を呼び、結果を `Device` の
//! 不変フィールドとして保持する。以降は読み取りのみ。

use alloc::collections::BTreeMap;
use core::fmt;

use crate::error::ModeError;
use crate::io::traits::IommuOps;

// ============================================================================
// Parameter Values
// ============================================================================

/// `iommu_mode` パラメータ: PASIDモード
pub const IOMMU_MODE_PASID: i64 = 0;
/// `iommu_mode` パラメータ: no-PASID (bypass) モード
pub const IOMMU_MODE_NO_PASID: i64 = 1;

/// 要求アドレッシングモード
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedMode {
    /// IOMMU能力から自動選択
    Auto,
    /// Translated を強制
    ForceTranslated,
    /// Bypass を強制
    ForceBypass,
}

impl RequestedMode {
    /// `iommu_mode` パラメータ値から変換
    pub fn from_param(value: i64) -> Self {
        match value {
            IOMMU_MODE_PASID => RequestedMode::ForceTranslated,
            IOMMU_MODE_NO_PASID => RequestedMode::ForceBypass,
            _ => RequestedMode::Auto,
        }
    }
}

/// アドレッシングモード（デバイス生存期間中固定）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressingMode {
    /// IOMMU変換 (PASID)
    Translated,
    /// IOMMUバイパス（物理アドレス + SGテーブル）
    Bypass,
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Translated => write!(f, "translated"),
            AddressingMode::Bypass => write!(f, "bypass"),
        }
    }
}

/// 変換識別子 (PASID)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pasid(pub u32);

/// IOMMU error types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IommuError {
    /// IOMMU not present
    NotPresent,
    /// No PASID left for this device
    PasidExhausted,
    /// Unknown PASID
    InvalidPasid,
    /// Region already mapped
    AlreadyMapped,
    /// Region not mapped
    NotMapped,
    /// Region wraps the address space
    InvalidRange,
    /// Hardware error
    HardwareError,
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IommuError::NotPresent => write!(f, "IOMMU not present"),
            IommuError::PasidExhausted => write!(f, "PASID exhausted"),
            IommuError::InvalidPasid => write!(f, "invalid PASID"),
            IommuError::AlreadyMapped => write!(f, "region already mapped"),
            IommuError::NotMapped => write!(f, "region not mapped"),
            IommuError::InvalidRange => write!(f, "invalid IOVA range"),
            IommuError::HardwareError => write!(f, "hardware error"),
        }
    }
}

// ============================================================================
// Mode Selector
// ============================================================================

/// モード選択結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSelection {
    pub mode: AddressingMode,
    /// Translated の場合のみ確保済みPASID
    pub pasid: Option<Pasid>,
}

/// アドレッシングモードを選択
///
/// - Auto: PASIDが確保できればTranslated、できなければBypass
/// - ForceTranslated / ForceBypass: 提供できなければ `UnsupportedMode`
pub fn select_mode<P: IommuOps + ?Sized>(
    ops: &P,
    requested: RequestedMode,
) -> Result<ModeSelection, ModeError> {
    match requested {
        RequestedMode::Auto => match try_translated(ops) {
            Ok(pasid) => Ok(ModeSelection {
                mode: AddressingMode::Translated,
                pasid: Some(pasid),
            }),
            Err(e) if ops.supports_passthrough() => {
                log::info!("IOMMU: translated mode unavailable ({}), using bypass", e);
                Ok(ModeSelection {
                    mode: AddressingMode::Bypass,
                    pasid: None,
                })
            }
            Err(e) => {
                log::error!("IOMMU: no usable addressing mode ({})", e);
                Err(ModeError::UnsupportedMode(requested))
            }
        },
        RequestedMode::ForceTranslated => {
            let pasid = try_translated(ops).map_err(|e| {
                log::error!("IOMMU: forced translated mode failed: {}", e);
                ModeError::UnsupportedMode(requested)
            })?;
            Ok(ModeSelection {
                mode: AddressingMode::Translated,
                pasid: Some(pasid),
            })
        }
        RequestedMode::ForceBypass => {
            if !ops.supports_passthrough() {
                log::error!("IOMMU: forced bypass mode but device is in a translated domain");
                return Err(ModeError::UnsupportedMode(requested));
            }
            Ok(ModeSelection {
                mode: AddressingMode::Bypass,
                pasid: None,
            })
        }
    }
}

fn try_translated<P: IommuOps + ?Sized>(ops: &P) -> Result<Pasid, IommuError> {
    if !ops.iommu_present() {
        return Err(IommuError::NotPresent);
    }
    ops.alloc_pasid()
}

// ============================================================================
// IOMMU Domain (PASID address space)
// ============================================================================

/// DMA mapping info
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaMapping {
    /// I/O virtual address
    pub iova: u64,
    /// Size in bytes
    pub size: u64,
    /// Read permission
    pub read: bool,
    /// Write permission
    pub write: bool,
}

/// IOMMU Domain (address space bound to one PASID)
#[derive(Debug, Default)]
pub struct IommuDomain {
    /// Mapped regions
    mappings: BTreeMap<u64, DmaMapping>,
    /// Total mapped size
    mapped_size: u64,
}

impl IommuDomain {
    /// Create a new domain
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a DMA region
    pub fn map(&mut self, iova: u64, size: u64, read: bool, write: bool) -> Result<(), IommuError> {
        let new_end = iova.checked_add(size).ok_or(IommuError::InvalidRange)?;

        // Check for overlapping mappings
        if let Some((existing_iova, mapping)) = self.mappings.range(..new_end).next_back() {
            if iova < existing_iova + mapping.size {
                return Err(IommuError::AlreadyMapped);
            }
        }

        self.mappings.insert(
            iova,
            DmaMapping {
                iova,
                size,
                read,
                write,
            },
        );
        self.mapped_size += size;

        Ok(())
    }

    /// Unmap a DMA region
    pub fn unmap(&mut self, iova: u64) -> Result<DmaMapping, IommuError> {
        let mapping = self.mappings.remove(&iova).ok_or(IommuError::NotMapped)?;
        self.mapped_size -= mapping.size;
        Ok(mapping)
    }

    /// Get total mapped size
    pub fn mapped_size(&self) -> u64 {
        self.mapped_size
    }

    /// Get all mappings
    pub fn mappings(&self) -> &BTreeMap<u64, DmaMapping> {
        &self.mappings
    }
}

// ============================================================================
// Tests
// ============================================================================
