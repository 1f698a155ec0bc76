// ============================================================================
// src/lib.rs - xHCI Host Controller Driver Core
// ============================================================================
//!
//! # xhci_hcd
//!
//! USB 3.x xHCI ホストコントローラドライバのコア部分。
//!
//! ## 構成
//! - `io::mmio`: MMIO レジスタアクセス (`RegisterIo`)
//! - `io::dma`: DMA 可視メモリ（仮想/物理アドレスの両方を追跡）
//! - `io::usb`: USB レベルの型安全な識別子
//! - `io::usb::xhci`: レジスタビュー、TRBリング、DCBAA、スロット管理、コントローラ
//!
//! カーネル側は MMIO 領域のマッピング、割り込みのルーティング、
//! `log` バックエンドの設定を担当する。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod io;

pub use config::XhciConfig;
pub use error::{InitStep, XhciError, XhciResult};
pub use io::usb::xhci::{ControllerStatus, PortObserver, TransferObserver, XhciController};
