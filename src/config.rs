// ============================================================================
// src/config.rs - Driver Module Parameters
// ============================================================================
//!
//! ドライバのモジュールパラメータ。
//!
//! `key=value` を空白区切りで並べた文字列からパースする:
//! ```text
//! iommu_mode=1 priv_load=0 start_col_index=-1 max_pinned_pages=65536 max_segments=256
//! ```
//!
//! `iommu_mode` の数値は `0` = PASID (Translated強制)、`1` = NO_PASID
//! (Bypass強制)、それ以外は自動選択。

use core::fmt;

use crate::io::iommu::RequestedMode;
use crate::mm::pin::PAGE_SIZE;

/// Scatter-Gatherセグメント長のデフォルト上限 (4GiB未満のページ境界)
pub const DEFAULT_MAX_SEGMENT_LEN: u32 = u32::MAX & !(PAGE_SIZE as u32 - 1);

/// 設定パラメータエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// 未知のパラメータ名
    UnknownKey,
    /// `key=value` 形式ではない
    Malformed,
    /// 値のパースに失敗
    InvalidValue,
    /// セグメント長の上限がページサイズ未満
    SegmentTooSmall,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownKey => write!(f, "unknown parameter"),
            ConfigError::Malformed => write!(f, "malformed parameter"),
            ConfigError::InvalidValue => write!(f, "invalid parameter value"),
            ConfigError::SegmentTooSmall => write!(f, "max_segment_len below page size"),
        }
    }
}

/// ドライバ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// 要求アドレッシングモード
    pub iommu_mode: RequestedMode,
    /// 特権ファームウェアロード (コアは報告のみ)
    pub priv_load: bool,
    /// AIE開始カラム (-1 = ファームウェア既定)
    pub start_col_index: i32,
    /// デバイスあたりのピン留めページ上限
    pub max_pinned_pages: usize,
    /// セグメント長の上限
    pub max_segment_len: u32,
    /// テーブルあたりのセグメント数上限
    pub max_segments: usize,
}

impl DriverConfig {
    pub const fn new() -> Self {
        Self {
            iommu_mode: RequestedMode::Auto,
            priv_load: false,
            start_col_index: -1,
            max_pinned_pages: usize::MAX,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            max_segments: usize::MAX,
        }
    }

    /// モジュールパラメータ文字列をパース
    ///
    /// 指定のないパラメータはデフォルト値のまま。
    pub fn parse(params: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for param in params.split_whitespace() {
            let (key, value) = param.split_once('=').ok_or(ConfigError::Malformed)?;
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// 単一パラメータを設定
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "iommu_mode" => {
                let raw: i64 = value.parse().map_err(|_| ConfigError::InvalidValue)?;
                self.iommu_mode = RequestedMode::from_param(raw);
            }
            "priv_load" => self.priv_load = parse_bool(value)?,
            "start_col_index" => {
                let col: i32 = value.parse().map_err(|_| ConfigError::InvalidValue)?;
                if col < -1 {
                    return Err(ConfigError::InvalidValue);
                }
                self.start_col_index = col;
            }
            "max_pinned_pages" => {
                self.max_pinned_pages = value.parse().map_err(|_| ConfigError::InvalidValue)?;
            }
            "max_segment_len" => {
                self.max_segment_len = parse_u32(value)?;
            }
            "max_segments" => {
                let max: usize = value.parse().map_err(|_| ConfigError::InvalidValue)?;
                if max == 0 {
                    return Err(ConfigError::InvalidValue);
                }
                self.max_segments = max;
            }
            _ => {
                log::warn!("config: unknown parameter '{}'", key);
                return Err(ConfigError::UnknownKey);
            }
        }
        Ok(())
    }

    /// パラメータ間の整合性を検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.max_segment_len as usize) < PAGE_SIZE {
            return Err(ConfigError::SegmentTooSmall);
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "y" | "Y" | "true" => Ok(true),
        "0" | "n" | "N" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue),
    }
}

/// 10進数または `0x` 付き16進数
fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue)
}
