// ============================================================================
// Memory Management Module
// バッファオブジェクト / ページピン留め / Scatter-Gather
// ============================================================================
pub mod bo;
pub mod pin;
pub mod sg;

pub use bo::{BoFlags, BoId, BufferObject};
pub use pin::{PagePinner, PinnedPage, PinnedPages, UserRange, PAGE_SIZE};
pub use sg::{ScatterGatherTable, Segment, SgBuilder};
