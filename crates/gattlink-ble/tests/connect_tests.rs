//! Integration tests for connection establishment

use std::sync::Arc;
use std::time::Duration;

use gattlink_ble::{ConnectGattResult, GattDevice};
use gattlink_core::testing::{ConnectBehavior, FakeTransport};
use gattlink_core::{
    ConnectionState, ConnectionStateChange, DeviceId, GattConfig, GattError, GattOperation,
    GattStatus, NoOpLogger,
};
use tokio::time::timeout;

fn test_device(transport: &Arc<FakeTransport>) -> GattDevice {
    GattDevice::new(transport.clone(), DeviceId::new("AA:BB:CC:DD:EE:02"))
}

fn test_config() -> GattConfig {
    GattConfig::new().with_logger(Arc::new(NoOpLogger))
}

#[tokio::test]
async fn test_connect_success() {
    let transport = Arc::new(FakeTransport::new());
    let device = test_device(&transport);

    let result = timeout(Duration::from_secs(1), device.connect(&test_config()))
        .await
        .unwrap();
    assert!(result.is_success());

    let gatt = tokio_test::assert_ok!(result.into_result());
    assert_eq!(gatt.device(), device.id());
    assert_eq!(gatt.connection_state(), ConnectionState::Connected);

    gatt.disconnect().await.unwrap();
    let handle = transport.last_handle().unwrap();
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(handle.close_calls(), 1);
}

#[tokio::test]
async fn test_connect_rejected_without_handle() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::Reject]);

    let result = test_device(&transport).connect(&test_config()).await;
    match result {
        ConnectGattResult::Rejected(error) => {
            assert_eq!(error, GattError::rejected(GattOperation::Connect));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(transport.connect_calls(), 1);
    assert!(transport.handles().is_empty());
}

#[tokio::test]
async fn test_connect_failure_status() {
    let transport = Arc::new(FakeTransport::new());
    let event = ConnectionStateChange::new(GattStatus(0x3E), ConnectionState::Connected);
    transport.script([ConnectBehavior::Accept(Some(event))]);

    let result = test_device(&transport).connect(&test_config()).await;
    match result {
        ConnectGattResult::Failure(error) => {
            assert_eq!(error, GattError::ConnectionFailed { event });
            assert!(error.is_connection_loss());
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(transport.last_handle().unwrap().close_calls(), 1);
}

#[tokio::test]
async fn test_connect_failure_on_early_disconnect() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::pending()]);
    let device = test_device(&transport);

    let attempt = tokio::spawn(async move { device.connect(&test_config()).await });
    let handle = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(handle) = transport.last_handle() {
                break handle;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    handle.simulate_disconnect(GattStatus::SUCCESS);

    let result = timeout(Duration::from_secs(1), attempt)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        ConnectGattResult::Failure(GattError::ConnectionFailed { .. })
    ));
    assert_eq!(handle.close_calls(), 1);
}

#[tokio::test]
async fn test_cancelled_connect_closes_handle() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::pending()]);
    let device = test_device(&transport);

    let result = timeout(Duration::from_millis(50), device.connect(&test_config())).await;
    assert!(result.is_err());

    let handle = transport.last_handle().unwrap();
    assert_eq!(handle.close_calls(), 1);
    assert_eq!(handle.disconnect_calls(), 0);
}

#[tokio::test]
async fn test_each_connect_uses_fresh_handle() {
    let transport = Arc::new(FakeTransport::new());
    let device = test_device(&transport);

    let first = device.connect(&test_config()).await.into_result().unwrap();
    first.close();
    let second = device.connect(&test_config()).await.into_result().unwrap();

    assert_eq!(transport.handles().len(), 2);
    assert!(first.is_closed());
    assert!(!second.is_closed());
}
