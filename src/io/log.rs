// ============================================================================
// src/io/log.rs - Driver Logging using the `log` crate
// ============================================================================
//!
//! ドライバ用ロギング。
//!
//! ## 機能
//! - `log`クレートを使用した標準的なログインターフェース
//! - 出力先 (`LogSink`) はプラットフォーム層が差し込む
//! - コンパイル時のログレベル上限 (`verbose_logging` feature)
//! - 実行時のログレベル変更（アトミック）
//! - デバイス名を前置するマクロ (`xdna_err!` など)
//!
//! ## 使用方法
//! ```ignore
//! npu_dma::io::log::init(&MY_SINK)?;
//! xdna_err!(device, "Create attr group failed");
//! ```

use alloc::format;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

// ============================================================================
// ログレベル定義
// ============================================================================

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// ============================================================================
// 出力先
// ============================================================================

/// ログ出力先
///
/// 1行分の整形済みテキストを受け取る。
pub trait LogSink: Sync {
    fn write_line(&self, line: &str);
}

// ============================================================================
// ロガー
// ============================================================================

/// ドライバロガー
pub struct DriverLogger {
    sink: &'static dyn LogSink,
    /// 現在のログレベル（実行時変更可能）
    level: AtomicUsize,
}

impl DriverLogger {
    pub const fn new(sink: &'static dyn LogSink) -> Self {
        Self {
            sink,
            level: AtomicUsize::new(MAX_LOG_LEVEL as usize),
        }
    }

    /// 実行時にログレベルを変更（コンパイル時上限を超えない）
    pub fn set_level(&self, level: LevelFilter) {
        self.level
            .store(level.min(MAX_LOG_LEVEL) as usize, Ordering::Relaxed);
    }

    /// 現在のログレベルを取得
    pub fn level(&self) -> LevelFilter {
        LevelFilter::iter()
            .nth(self.level.load(Ordering::Relaxed))
            .unwrap_or(LevelFilter::Info)
    }
}

impl Log for DriverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{:<5}] {}", record.level(), record.args());
        self.sink.write_line(&line);
    }

    fn flush(&self) {
        // 出力はバッファリングしないため何もしない
    }
}

/// グローバルロガーインスタンス
static LOGGER: spin::Once<DriverLogger> = spin::Once::new();

// ============================================================================
// 公開API
// ============================================================================

/// ロギングシステムを初期化
///
/// 二度目以降の呼び出しは `SetLoggerError` を返す。
pub fn init(sink: &'static dyn LogSink) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| DriverLogger::new(sink));
    log::set_logger(logger)?;
    log::set_max_level(MAX_LOG_LEVEL);
    Ok(())
}

/// 実行時にログレベルを変更
pub fn set_log_level(level: LevelFilter) {
    if let Some(logger) = LOGGER.get() {
        logger.set_level(level);
    }
    log::set_max_level(level.min(MAX_LOG_LEVEL));
}

/// ロガーが初期化済みかどうか
pub fn is_initialized() -> bool {
    LOGGER.is_completed()
}

// ============================================================================
// デバイス名前置マクロ
// ============================================================================

/// エラーログ（デバイス名付き）
#[macro_export]
macro_rules! xdna_err {
    ($dev:expr, $($arg:tt)*) => {
        $crate::__log::error!("{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

/// 警告ログ（デバイス名付き）
#[macro_export]
macro_rules! xdna_warn {
    ($dev:expr, $($arg:tt)*) => {
        $crate::__log::warn!("{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

/// 情報ログ（デバイス名付き）
#[macro_export]
macro_rules! xdna_info {
    ($dev:expr, $($arg:tt)*) => {
        $crate::__log::info!("{}: {}", $dev.name(), format_args!($($arg)*))
    };
}

/// デバッグログ（デバイス名付き）
#[macro_export]
macro_rules! xdna_dbg {
    ($dev:expr, $($arg:tt)*) => {
        $crate::__log::debug!("{}: {}", $dev.name(), format_args!($($arg)*))
    };
}
