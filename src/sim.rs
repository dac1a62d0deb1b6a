// ============================================================================
// src/sim.rs - In-memory Platform
// ============================================================================
//!
//! ソフトウェアのみで動作するプラットフォーム実装。
//!
//! IOMMU、ページピン留め、セグメント登録、属性ツリーの4能力をメモリ上で
//! 模擬する。物理ページ配置 (`PageLayout`) と各操作の失敗を注入でき、
//! 呼び出し順は `SimEvent` として記録される。
//!
//! ```text
//! SimPlatform (clone = 同じ状態を共有)
//!   +-- domains:  PASID -> IommuDomain (IOVA = ユーザー仮想アドレス)
//!   +-- pins:     virt -> 参照カウント
//!   +-- programmed: BoId -> Segment列
//!   +-- groups:   名前 -> 属性列
//! ```

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{PinError, RegistrationError};
use crate::io::iommu::{IommuDomain, IommuError, Pasid};
use crate::io::sysfs::{DeviceAttribute, SysfsError};
use crate::io::traits::{AttributeTree, IommuOps, PinOps, SegmentProgrammer};
use crate::mm::bo::{BoFlags, BoId};
use crate::mm::pin::{PinnedPage, UserRange, PAGE_SIZE};
use crate::mm::sg::{ScatterGatherTable, Segment};

/// 模擬物理メモリの先頭
const PHYS_BASE: u64 = 0x1_0000_0000;

/// 物理ページ番号の範囲 (4GiB分)
const PFN_MASK: u64 = 0xf_ffff;

/// ユーザーページから物理ページへの配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// 仮想的に連続なページは物理的にも連続
    Contiguous,
    /// 隣接ページは常に不連続
    Scattered,
    /// n ページごとに物理的な隙間が入る
    Chunked(usize),
}

impl PageLayout {
    fn phys_of(self, virt: VirtAddr) -> PhysAddr {
        let index = (virt.as_u64() / PAGE_SIZE as u64) & PFN_MASK;
        let frame = match self {
            PageLayout::Contiguous => index,
            PageLayout::Scattered => index * 2,
            PageLayout::Chunked(n) => index + index / n.max(1) as u64,
        };
        PhysAddr::new(PHYS_BASE + frame * PAGE_SIZE as u64)
    }
}

/// 記録されるプラットフォーム操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Pin { virt: u64, write: bool },
    Unpin(u64),
    Program(BoId),
    Release(BoId),
    Attach { pasid: Pasid, iova: u64 },
    Detach { pasid: Pasid, iova: u64 },
}

#[derive(Debug)]
struct SimState {
    iommu_present: bool,
    passthrough: bool,
    layout: PageLayout,
    next_pasid: u32,
    domains: BTreeMap<Pasid, IommuDomain>,
    pins: BTreeMap<u64, usize>,
    programmed: BTreeMap<BoId, Vec<Segment>>,
    groups: BTreeMap<String, Vec<DeviceAttribute>>,
    events: Vec<SimEvent>,
    fail_pin_at: Option<u64>,
    fail_pasid_alloc: bool,
    fail_program: bool,
    fail_attach: bool,
    fail_attribute_tree: bool,
}

/// メモリ上のプラットフォーム
///
/// クローンは同じ状態を共有する。デバイスに所有権を渡した後も、
/// 手元のクローンから状態を観測できる。
#[derive(Debug, Clone)]
pub struct SimPlatform {
    state: Arc<Mutex<SimState>>,
}

impl SimPlatform {
    fn new(iommu_present: bool, passthrough: bool, layout: PageLayout) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                iommu_present,
                passthrough,
                layout,
                next_pasid: 1,
                domains: BTreeMap::new(),
                pins: BTreeMap::new(),
                programmed: BTreeMap::new(),
                groups: BTreeMap::new(),
                events: Vec::new(),
                fail_pin_at: None,
                fail_pasid_alloc: false,
                fail_program: false,
                fail_attach: false,
                fail_attribute_tree: false,
            })),
        }
    }

    /// IOMMUあり、パススルーも許可
    pub fn with_iommu(layout: PageLayout) -> Self {
        Self::new(true, true, layout)
    }

    /// IOMMUなし
    pub fn bypass_only(layout: PageLayout) -> Self {
        Self::new(false, true, layout)
    }

    /// IOMMUあり、パススルー不可（厳格な変換ドメイン）
    pub fn strict_translated(layout: PageLayout) -> Self {
        Self::new(true, false, layout)
    }

    /// 状態を共有するハンドル
    pub fn shared(&self) -> Self {
        self.clone()
    }

    // ------------------------------------------------------------------------
    // 失敗注入
    // ------------------------------------------------------------------------

    /// 指定ページのピン留めを `NotResident` で失敗させる
    pub fn fail_pin_at(&self, addr: u64) {
        self.state.lock().fail_pin_at = Some(addr);
    }

    pub fn fail_pasid_alloc(&self, fail: bool) {
        self.state.lock().fail_pasid_alloc = fail;
    }

    pub fn fail_program(&self, fail: bool) {
        self.state.lock().fail_program = fail;
    }

    pub fn fail_attach(&self, fail: bool) {
        self.state.lock().fail_attach = fail;
    }

    pub fn fail_attribute_tree(&self, fail: bool) {
        self.state.lock().fail_attribute_tree = fail;
    }

    /// 全ての失敗注入を解除
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_pin_at = None;
        state.fail_pasid_alloc = false;
        state.fail_program = false;
        state.fail_attach = false;
        state.fail_attribute_tree = false;
    }

    // ------------------------------------------------------------------------
    // 観測
    // ------------------------------------------------------------------------

    /// ピン留め中のページ数（参照カウントの合計）
    pub fn pinned_pages(&self) -> usize {
        self.state.lock().pins.values().sum()
    }

    /// 確保中のPASID数
    pub fn live_pasids(&self) -> usize {
        self.state.lock().domains.len()
    }

    /// 全PASIDにアタッチされた範囲の数
    pub fn attached_ranges(&self) -> usize {
        self.state
            .lock()
            .domains
            .values()
            .map(|d| d.mappings().len())
            .sum()
    }

    /// デバイスに登録中のセグメントテーブル数
    pub fn programmed_tables(&self) -> usize {
        self.state.lock().programmed.len()
    }

    /// BOに登録されたセグメント列
    pub fn programmed(&self, bo: BoId) -> Option<Vec<Segment>> {
        self.state.lock().programmed.get(&bo).cloned()
    }

    /// 属性グループの内容
    pub fn attribute_group(&self, name: &str) -> Option<Vec<DeviceAttribute>> {
        self.state.lock().groups.get(name).cloned()
    }

    /// 記録された操作列
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl IommuOps for SimPlatform {
    fn iommu_present(&self) -> bool {
        self.state.lock().iommu_present
    }

    fn supports_passthrough(&self) -> bool {
        self.state.lock().passthrough
    }

    fn alloc_pasid(&self) -> Result<Pasid, IommuError> {
        let mut state = self.state.lock();
        if !state.iommu_present {
            return Err(IommuError::NotPresent);
        }
        if state.fail_pasid_alloc {
            return Err(IommuError::PasidExhausted);
        }
        let pasid = Pasid(state.next_pasid);
        state.next_pasid += 1;
        state.domains.insert(pasid, IommuDomain::new());
        Ok(pasid)
    }

    fn free_pasid(&self, pasid: Pasid) {
        self.state.lock().domains.remove(&pasid);
    }

    fn attach_range(
        &self,
        pasid: Pasid,
        range: &UserRange,
        flags: BoFlags,
    ) -> Result<u64, IommuError> {
        let mut state = self.state.lock();
        if state.fail_attach {
            return Err(IommuError::HardwareError);
        }
        let iova = range.start().as_u64();
        let domain = state.domains.get_mut(&pasid).ok_or(IommuError::InvalidPasid)?;
        domain.map(
            iova,
            range.len() as u64,
            flags.contains(BoFlags::DEVICE_READ),
            flags.contains(BoFlags::DEVICE_WRITE),
        )?;
        state.events.push(SimEvent::Attach { pasid, iova });
        Ok(iova)
    }

    fn detach_range(&self, pasid: Pasid, range: &UserRange) -> Result<(), IommuError> {
        let mut state = self.state.lock();
        let iova = range.start().as_u64();
        let domain = state.domains.get_mut(&pasid).ok_or(IommuError::InvalidPasid)?;
        domain.unmap(iova)?;
        state.events.push(SimEvent::Detach { pasid, iova });
        Ok(())
    }
}

impl PinOps for SimPlatform {
    fn pin_page(&self, addr: VirtAddr, write: bool) -> Result<PhysAddr, PinError> {
        let mut state = self.state.lock();
        let virt = addr.as_u64();
        if state.fail_pin_at == Some(virt) {
            return Err(PinError::NotResident);
        }
        *state.pins.entry(virt).or_insert(0) += 1;
        state.events.push(SimEvent::Pin { virt, write });
        Ok(state.layout.phys_of(addr))
    }

    fn unpin_page(&self, page: PinnedPage) {
        let mut state = self.state.lock();
        let virt = page.virt.as_u64();
        let Some(count) = state.pins.get_mut(&virt) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.pins.remove(&virt);
        }
        state.events.push(SimEvent::Unpin(virt));
    }
}

impl SegmentProgrammer for SimPlatform {
    fn program_segments(
        &self,
        bo: BoId,
        table: &ScatterGatherTable,
    ) -> Result<(), RegistrationError> {
        let mut state = self.state.lock();
        if state.fail_program {
            return Err(RegistrationError::Rejected);
        }
        if state.programmed.contains_key(&bo) {
            return Err(RegistrationError::Rejected);
        }
        state.programmed.insert(bo, table.segments().to_vec());
        state.events.push(SimEvent::Program(bo));
        Ok(())
    }

    fn release_segments(&self, bo: BoId) {
        let mut state = self.state.lock();
        if state.programmed.remove(&bo).is_some() {
            state.events.push(SimEvent::Release(bo));
        }
    }
}

impl AttributeTree for SimPlatform {
    fn create_group(&self, group: &str, attrs: &[DeviceAttribute]) -> Result<(), SysfsError> {
        let mut state = self.state.lock();
        if state.fail_attribute_tree {
            return Err(SysfsError::Unavailable);
        }
        if state.groups.contains_key(group) {
            return Err(SysfsError::AlreadyExists);
        }
        state.groups.insert(String::from(group), attrs.to_vec());
        Ok(())
    }

    fn remove_group(&self, group: &str) {
        self.state.lock().groups.remove(group);
    }
}
