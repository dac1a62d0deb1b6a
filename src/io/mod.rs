// ============================================================================
// I/O Subsystem Module
// IOMMU / DMAマッピング / デバイス属性 / ロギング
// ============================================================================
pub mod dma;
pub mod iommu;
pub mod log;
pub mod sysfs;
pub mod traits;

pub use dma::{MappingHandle, MappingState};
pub use iommu::{AddressingMode, IommuDomain, IommuError, ModeSelection, Pasid, RequestedMode};
pub use sysfs::{DeviceAttribute, SysfsError};
