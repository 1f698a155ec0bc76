// ============================================================================
// tests/integration_test.rs - 公開APIの統合テスト
// ============================================================================
//!
//! 応答しない MMIO 領域（ただのメモリ）に対して、公開APIだけで
//! 初期化失敗時の振る舞いを確認する。

use core::future::Future;
use core::pin::pin;
use core::task::{Context, Poll, Waker};

use x86_64::PhysAddr;
use xhci_hcd::io::{MmioRegion, PhysicalMemoryMapper};
use xhci_hcd::{ControllerStatus, InitStep, XhciConfig, XhciController, XhciError};

/// 応答しないコントローラ領域（全レジスタが 0 のまま）
fn dead_region(backing: &[u32]) -> MmioRegion {
    let mapper = PhysicalMemoryMapper::new(0);
    // SAFETY: backing はテスト終了まで生存し、このテスト専用
    unsafe {
        MmioRegion::map(
            PhysAddr::new(backing.as_ptr() as u64),
            backing.len() * 4,
            &mapper,
        )
    }
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_controller_is_shareable() {
    assert_send_sync::<XhciController<MmioRegion>>();
}

#[test]
fn test_unresponsive_controller_fails_at_halt() {
    let backing = vec![0u32; 0x1000];
    let controller = XhciController::new(
        dead_region(&backing),
        XhciConfig {
            poll_limit: 64,
            ..XhciConfig::default()
        },
    );

    match controller.initialize() {
        Err(XhciError::ControllerInitFailed { step, source }) => {
            assert_eq!(step, InitStep::Halt);
            assert!(matches!(*source, XhciError::RegisterTimeout { .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(controller.status(), ControllerStatus::ControllerNotInitialized);
    assert_eq!(controller.process_events(), Err(XhciError::NotInitialized));

    let mut request = pin!(controller.request_slot());
    let mut cx = Context::from_waker(Waker::noop());
    assert_eq!(
        request.as_mut().poll(&mut cx),
        Poll::Ready(Err(XhciError::NotInitialized))
    );
}

#[test]
fn test_invalid_config_rejected_before_hardware_access() {
    let backing = vec![0u32; 0x1000];
    let controller = XhciController::new(
        dead_region(&backing),
        XhciConfig {
            event_ring_size: 8,
            ..XhciConfig::default()
        },
    );

    match controller.initialize() {
        Err(err @ XhciError::ControllerInitFailed { .. }) => {
            assert!(err.is_fatal());
            assert!(matches!(
                err,
                XhciError::ControllerInitFailed {
                    step: InitStep::ValidateConfig,
                    ..
                }
            ));
        }
        other => panic!("unexpected {:?}", other),
    }
    // USBCMD には何も書かれていない
    assert_eq!(backing[0], 0);
}
