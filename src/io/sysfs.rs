// ============================================================================
// src/io/sysfs.rs - Read-only Device Attribute Reporting
// ============================================================================
//!
//! デバイス属性の読み取り専用レポート
//!
//! `Device` の不変フィールドを属性ツリーへ投影する。状態遷移は持たず、
//! 登録失敗はログに残すだけでデバイスは動作を継続する。

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::device::Device;
use crate::io::traits::{AttributeTree, DevicePlatform};

/// 属性グループ名
pub const ATTR_GROUP: &str = "amdxdna";

/// 公開する属性名
pub const ATTR_NAMES: [&str; 3] = ["device_type", "vbnv", "fw_version"];

/// 属性ツリーエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysfsError {
    /// 観測メカニズムが利用できない
    Unavailable,
    /// 同名グループが既に存在
    AlreadyExists,
}

impl fmt::Display for SysfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysfsError::Unavailable => write!(f, "attribute tree unavailable"),
            SysfsError::AlreadyExists => write!(f, "attribute group already exists"),
        }
    }
}

/// 属性1件（名前と表示値）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttribute {
    pub name: &'static str,
    pub value: String,
}

/// 属性の表示値を生成
pub fn show<P: DevicePlatform>(device: &Device<P>, name: &str) -> Option<String> {
    let value = match name {
        "device_type" => format!("{}\n", device.info().device_type.code()),
        "vbnv" => format!("{}\n", device.info().vbnv),
        "fw_version" => format!("{}\n", device.fw_version()),
        _ => return None,
    };
    Some(value)
}

/// 全属性を生成
pub fn attributes<P: DevicePlatform>(device: &Device<P>) -> Vec<DeviceAttribute> {
    ATTR_NAMES
        .iter()
        .filter_map(|&name| show(device, name).map(|value| DeviceAttribute { name, value }))
        .collect()
}

/// 属性グループを登録
///
/// 失敗は致命的ではない。登録できたかどうかを返す。
pub fn init<P: DevicePlatform>(device: &Device<P>) -> bool {
    let attrs = attributes(device);
    match device.platform().create_group(ATTR_GROUP, &attrs) {
        Ok(()) => true,
        Err(e) => {
            crate::xdna_err!(device, "Create attr group failed: {}", e);
            false
        }
    }
}

/// 属性グループを削除
pub fn fini<T: AttributeTree + ?Sized>(tree: &T) {
    tree.remove_group(ATTR_GROUP);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::{DeviceInfo, DeviceType, FirmwareVersion};
    use crate::sim::{PageLayout, SimPlatform};

    fn probe(platform: SimPlatform) -> Device<SimPlatform> {
        Device::probe(
            platform,
            DeviceInfo::new("npu0", DeviceType::Kmq, "RyzenAI-npu1"),
            FirmwareVersion::new(1, 5, 2, 380),
            DriverConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_attribute_format() {
        let device = probe(SimPlatform::bypass_only(PageLayout::Contiguous));
        assert_eq!(show(&device, "device_type").as_deref(), Some("0\n"));
        assert_eq!(show(&device, "vbnv").as_deref(), Some("RyzenAI-npu1\n"));
        assert_eq!(show(&device, "fw_version").as_deref(), Some("1.5.2.380\n"));
        assert_eq!(show(&device, "bogus"), None);
    }

    #[test]
    fn test_group_registered_at_probe() {
        let device = probe(SimPlatform::bypass_only(PageLayout::Contiguous));
        assert!(device.sysfs_registered());
        let group = device.platform().attribute_group(ATTR_GROUP).unwrap();
        let names: Vec<&str> = group.iter().map(|a| a.name).collect();
        assert_eq!(names, ATTR_NAMES);
    }

    #[test]
    fn test_registration_failure_is_not_fatal() {
        let platform = SimPlatform::bypass_only(PageLayout::Contiguous);
        platform.fail_attribute_tree(true);
        let device = probe(platform);
        assert!(!device.sysfs_registered());
        assert!(device.platform().attribute_group(ATTR_GROUP).is_none());
    }
}
