// ============================================================================
// I/O Module
// ============================================================================
//! MMIO アクセス、DMA メモリ、USB ホストコントローラドライバ。

pub mod dma;
pub mod mmio;
pub mod usb;

pub use dma::{DmaArray, PhysicalMemoryMapper};
pub use mmio::{MmioRegion, RegisterIo};
