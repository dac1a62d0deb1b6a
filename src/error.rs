//! 統一エラーハンドリングモジュール
//!
//! マッピングコア全体で使用されるエラー型を定義し、
//! 各サブシステムのエラーから `DriverError` への変換を提供します。
//!
//! 失敗の扱い:
//! - `ModeError` はプローブ時の致命的エラー（デバイス起動を中止）
//! - `MappingError` はBO単位のエラー（完全にロールバックしてから返す）

use core::fmt;

use crate::config::ConfigError;
use crate::io::iommu::{IommuError, RequestedMode};
use crate::io::sysfs::SysfsError;

/// ドライバ全体の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// アドレッシングモード選択エラー
    Mode(ModeError),
    /// マッピングエラー
    Mapping(MappingError),
    /// IOMMU操作エラー
    Iommu(IommuError),
    /// 属性ツリー登録エラー
    Sysfs(SysfsError),
    /// 設定パラメータエラー
    Config(ConfigError),
}

/// アドレッシングモード選択エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeError {
    /// プラットフォームが要求されたモードを提供できない
    UnsupportedMode(RequestedMode),
}

/// ページピン留めエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// 範囲が不正（非アライン、空、非カノニカル、オーバーフロー）
    InvalidRange,
    /// ページが存在しない
    NotResident,
    /// 権限拒否
    PermissionDenied,
    /// ピン留めクォータ超過
    QuotaExceeded,
}

/// Scatter-Gatherテーブル構築エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgError {
    /// 要求長がページ容量を超えている
    InvalidLength { requested: usize, capacity: usize },
    /// セグメント数がデバイスの上限を超える
    TooManySegments { segments: usize, limit: usize },
    /// セグメント配列の確保に失敗
    OutOfMemory,
}

/// デバイス側登録エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationError {
    /// デバイスがセグメントテーブルを拒否
    Rejected,
    /// デバイス側のディスクリプタが枯渇
    OutOfDescriptors,
    /// IOMMUへのアタッチ失敗 (Translatedモード)
    Attach(IommuError),
}

/// BOマッピングエラー（失敗した段階を識別する）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// 既にマップ済み（暗黙の再マップはしない）
    AlreadyMapped,
    /// ピン留め段階で失敗
    PinFailure(PinError),
    /// テーブル構築段階で失敗
    TableBuildFailure(SgError),
    /// デバイス登録段階で失敗
    DeviceRegistrationFailure(RegistrationError),
}

// ===== Display implementations =====

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Mode(e) => write!(f, "Mode error: {}", e),
            DriverError::Mapping(e) => write!(f, "Mapping error: {}", e),
            DriverError::Iommu(e) => write!(f, "IOMMU error: {}", e),
            DriverError::Sysfs(e) => write!(f, "Sysfs error: {}", e),
            DriverError::Config(e) => write!(f, "Config error: {}", e),
        }
    }
}

impl fmt::Display for ModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeError::UnsupportedMode(req) => write!(f, "unsupported addressing mode {:?}", req),
        }
    }
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinError::InvalidRange => write!(f, "invalid virtual range"),
            PinError::NotResident => write!(f, "page not resident"),
            PinError::PermissionDenied => write!(f, "permission denied"),
            PinError::QuotaExceeded => write!(f, "pinning quota exceeded"),
        }
    }
}

impl fmt::Display for SgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SgError::InvalidLength {
                requested,
                capacity,
            } => write!(
                f,
                "invalid length {:#x} (page capacity {:#x})",
                requested, capacity
            ),
            SgError::TooManySegments { segments, limit } => {
                write!(f, "{} segments exceed device limit {}", segments, limit)
            }
            SgError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::Rejected => write!(f, "segment table rejected by device"),
            RegistrationError::OutOfDescriptors => write!(f, "out of device descriptors"),
            RegistrationError::Attach(e) => write!(f, "PASID attach failed: {}", e),
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::AlreadyMapped => write!(f, "buffer object already mapped"),
            MappingError::PinFailure(e) => write!(f, "pin failure: {}", e),
            MappingError::TableBuildFailure(e) => write!(f, "table build failure: {}", e),
            MappingError::DeviceRegistrationFailure(e) => {
                write!(f, "device registration failure: {}", e)
            }
        }
    }
}

// ===== From implementations for sub-errors =====

impl From<ModeError> for DriverError {
    fn from(e: ModeError) -> Self {
        DriverError::Mode(e)
    }
}

impl From<MappingError> for DriverError {
    fn from(e: MappingError) -> Self {
        DriverError::Mapping(e)
    }
}

impl From<IommuError> for DriverError {
    fn from(e: IommuError) -> Self {
        DriverError::Iommu(e)
    }
}

impl From<SysfsError> for DriverError {
    fn from(e: SysfsError) -> Self {
        DriverError::Sysfs(e)
    }
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        DriverError::Config(e)
    }
}

impl From<PinError> for MappingError {
    fn from(e: PinError) -> Self {
        MappingError::PinFailure(e)
    }
}

impl From<SgError> for MappingError {
    fn from(e: SgError) -> Self {
        MappingError::TableBuildFailure(e)
    }
}

impl From<RegistrationError> for MappingError {
    fn from(e: RegistrationError) -> Self {
        MappingError::DeviceRegistrationFailure(e)
    }
}

// ===== Result type alias =====

/// ドライバの結果型エイリアス
pub type DriverResult<T> = Result<T, DriverError>;

// ===== Error extension trait =====

/// エラーに追加情報を付加するためのトレイト
pub trait ErrorContext<T> {
    /// エラーにコンテキスト情報を追加
    fn context(self, ctx: &'static str) -> Result<T, ContextualError>;
}

/// コンテキスト付きエラー
#[derive(Debug)]
pub struct ContextualError {
    pub error: DriverError,
    pub context: &'static str,
}

impl<T, E: Into<DriverError>> ErrorContext<T> for Result<T, E> {
    fn context(self, ctx: &'static str) -> Result<T, ContextualError> {
        self.map_err(|e| ContextualError {
            error: e.into(),
            context: ctx,
        })
    }
}

impl fmt::Display for ContextualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.error)
    }
}
