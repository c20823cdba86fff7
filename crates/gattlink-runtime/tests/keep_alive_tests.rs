//! Integration tests for the keep-alive supervisor
//!
//! The supervisor runs against the in-memory transport; physical drops are
//! simulated through the handles it hands out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gattlink_ble::GattIo;
use gattlink_core::testing::{success_responder, ConnectBehavior, FakeTransport, HandleOptions};
use gattlink_core::{
    CharacteristicHandle, ConnectionState, ConnectionStateChange, DeviceId, GattError,
    GattOperation, GattStatus, KeepAliveConfig, Uuid,
};
use gattlink_runtime::{GattRegistry, KeepAliveEvent, KeepAliveGatt, KeepAliveState};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(2);

fn test_device() -> DeviceId {
    DeviceId::new("AA:BB:CC:DD:EE:10")
}

fn test_config() -> KeepAliveConfig {
    let _ = tracing_subscriber::fmt::try_init();
    KeepAliveConfig::testing()
}

fn characteristic() -> CharacteristicHandle {
    CharacteristicHandle::new(Uuid::from_u128(0x2A6E), Uuid::from_u128(0x181A), 4)
}

fn supervised(transport: &Arc<FakeTransport>) -> KeepAliveGatt {
    KeepAliveGatt::builder(transport.clone(), test_device())
        .config(test_config())
        .build()
        .expect("valid configuration")
}

async fn wait_for_state(
    gatt: &KeepAliveGatt,
    predicate: impl FnMut(&KeepAliveState) -> bool,
) -> KeepAliveState {
    let mut state = gatt.state();
    let reached = timeout(WAIT, state.wait_for(predicate))
        .await
        .expect("state should be reached in time")
        .expect("state channel should stay open");
    KeepAliveState::clone(&reached)
}

async fn next_event(events: &mut broadcast::Receiver<KeepAliveEvent>) -> KeepAliveEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event stream should stay open")
}

async fn expect_connected(events: &mut broadcast::Receiver<KeepAliveEvent>) {
    let event = next_event(events).await;
    assert!(
        matches!(event, KeepAliveEvent::Connected(_)),
        "expected Connected, got {:?}",
        event
    );
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_after_rejection() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::Reject]);
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    assert_eq!(gatt.connect(), Ok(true));
    let event = next_event(&mut events).await;
    assert!(matches!(
        event,
        KeepAliveEvent::Rejected(GattError::Rejected {
            operation: GattOperation::Connect
        })
    ));
    let settled = wait_for_state(&gatt, |state| {
        matches!(state, KeepAliveState::Disconnected(Some(_)))
    })
    .await;
    assert_eq!(
        settled,
        KeepAliveState::Disconnected(Some(GattError::rejected(GattOperation::Connect)))
    );
    assert_eq!(transport.connect_calls(), 1);

    assert_eq!(gatt.connect(), Ok(true));
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    expect_connected(&mut events).await;
    assert_eq!(transport.connect_calls(), 2);
}

#[tokio::test]
async fn test_connect_reports_running_attempt() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);

    assert_eq!(gatt.connect(), Ok(true));
    assert_eq!(gatt.connect(), Ok(false));
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    assert_eq!(gatt.connect(), Ok(false));
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_drop_reconnects_with_one_disconnected_event() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    gatt.connect().unwrap();
    expect_connected(&mut events).await;
    let first = transport.last_handle().unwrap();

    first.simulate_disconnect(GattStatus(0x08));

    match next_event(&mut events).await {
        KeepAliveEvent::Disconnected {
            was_connected,
            connection_attempt,
        } => {
            assert!(was_connected);
            assert_eq!(connection_attempt, 1);
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
    expect_connected(&mut events).await;

    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(transport.connect_calls(), 2);
    assert_eq!(first.disconnect_calls(), 0);
    assert_eq!(first.close_calls(), 1);
}

#[tokio::test]
async fn test_failed_attempt_retries() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::Accept(Some(ConnectionStateChange::new(
        GattStatus::ERROR,
        ConnectionState::Disconnected,
    )))]);
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    gatt.connect().unwrap();
    match next_event(&mut events).await {
        KeepAliveEvent::Disconnected {
            was_connected,
            connection_attempt,
        } => {
            assert!(!was_connected);
            assert_eq!(connection_attempt, 1);
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
    expect_connected(&mut events).await;
    assert_eq!(transport.connect_calls(), 2);
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    gatt.connect().unwrap();
    expect_connected(&mut events).await;
    let handle = transport.last_handle().unwrap();

    gatt.disconnect();
    wait_for_state(&gatt, |state| *state == KeepAliveState::Disconnected(None)).await;
    assert!(matches!(
        next_event(&mut events).await,
        KeepAliveEvent::Disconnected {
            was_connected: true,
            connection_attempt: 1
        }
    ));
    assert_eq!(handle.disconnect_calls(), 1);
    assert!(gatt.gatt().is_none());

    assert_eq!(gatt.connect(), Ok(true));
    expect_connected(&mut events).await;
    assert_eq!(transport.connect_calls(), 2);
}

#[tokio::test]
async fn test_disconnect_then_connect_replaces_connection() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    gatt.connect().unwrap();
    expect_connected(&mut events).await;
    let first = transport.last_handle().unwrap();

    gatt.disconnect();
    assert_eq!(gatt.connect(), Ok(true));

    assert!(matches!(
        next_event(&mut events).await,
        KeepAliveEvent::Disconnected {
            was_connected: true,
            connection_attempt: 1
        }
    ));
    expect_connected(&mut events).await;
    assert_eq!(first.disconnect_calls(), 1);
    assert_eq!(first.close_calls(), 1);
    assert_eq!(transport.connect_calls(), 2);
    assert!(gatt.current_state().is_connected());
}

#[tokio::test]
async fn test_disconnect_abandons_pending_attempt() {
    let transport = Arc::new(FakeTransport::new());
    transport.script([ConnectBehavior::pending()]);
    let gatt = supervised(&transport);
    let mut events = gatt.events();

    gatt.connect().unwrap();
    let handle = timeout(WAIT, async {
        loop {
            if let Some(handle) = transport.last_handle() {
                break handle;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(gatt.current_state(), KeepAliveState::Connecting);

    gatt.disconnect();
    assert!(matches!(
        next_event(&mut events).await,
        KeepAliveEvent::Disconnected {
            was_connected: false,
            connection_attempt: 1
        }
    ));
    wait_for_state(&gatt, |state| *state == KeepAliveState::Disconnected(None)).await;
    assert_eq!(handle.close_calls(), 1);
    assert_eq!(handle.disconnect_calls(), 0);

    assert_eq!(gatt.connect(), Ok(true));
    expect_connected(&mut events).await;
    assert_eq!(transport.connect_calls(), 2);
}

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_while_connected_disconnects_once() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);

    gatt.connect().unwrap();
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    let handle = transport.last_handle().unwrap();

    gatt.cancel();
    let settled = wait_for_state(&gatt, KeepAliveState::is_cancelled).await;
    assert_eq!(settled, KeepAliveState::Cancelled(None));
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(handle.close_calls(), 1);

    let refused = assert_err!(gatt.connect());
    assert!(matches!(refused, GattError::Cancelled { .. }));
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_drop_cancels_supervisor() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);
    gatt.connect().unwrap();
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    let handle = transport.last_handle().unwrap();

    let mut state = gatt.state();
    drop(gatt);
    timeout(WAIT, state.wait_for(KeepAliveState::is_cancelled))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_unresponsive_disconnect_is_forced() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_handle_options(HandleOptions {
        report_disconnect: false,
        ..HandleOptions::default()
    });
    let gatt = supervised(&transport);
    gatt.connect().unwrap();
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    let handle = transport.last_handle().unwrap();

    gatt.cancel();
    wait_for_state(&gatt, KeepAliveState::is_cancelled).await;
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(handle.close_calls(), 1);
}

// ----------------------------------------------------------------------------
// Delegated I/O
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_io_requires_active_connection() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_handle_options(HandleOptions {
        responder: Some(success_responder()),
        ..HandleOptions::default()
    });
    let gatt = supervised(&transport);

    assert_eq!(
        gatt.read_characteristic(&characteristic()).await,
        Err(GattError::NotReady)
    );
    assert_eq!(gatt.services(), Err(GattError::NotReady));

    gatt.connect().unwrap();
    wait_for_state(&gatt, KeepAliveState::is_connected).await;
    let read = gatt.read_characteristic(&characteristic()).await.unwrap();
    assert_eq!(read.value, 4u16.to_le_bytes().to_vec());
    assert_eq!(gatt.request_mtu(247).await.unwrap().mtu, 247);
}

#[tokio::test]
async fn test_characteristic_stream_survives_reconnect() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = supervised(&transport);
    let mut changes = gatt.characteristic_changed();
    let mut events = gatt.events();

    gatt.connect().unwrap();
    expect_connected(&mut events).await;
    let first = transport.last_handle().unwrap();
    first.callback().on_characteristic_changed(&characteristic(), &[1]);
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.value, vec![1]);

    first.simulate_disconnect(GattStatus::ERROR);
    next_event(&mut events).await;
    expect_connected(&mut events).await;

    let second = transport.last_handle().unwrap();
    second
        .callback()
        .on_characteristic_changed(&characteristic(), &[2]);
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.value, vec![2]);
    assert_eq!(change.characteristic, characteristic());
}

// ----------------------------------------------------------------------------
// On-Connect Action and Event Handler
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_on_connect_runs_on_every_connection() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_handle_options(HandleOptions {
        responder: Some(success_responder()),
        ..HandleOptions::default()
    });
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let gatt = KeepAliveGatt::builder(transport.clone(), test_device())
        .config(test_config())
        .on_connect(move |gatt| {
            let counter = counter.clone();
            async move {
                gatt.discover_services().await?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), GattError>(())
            }
        })
        .build()
        .unwrap();
    let mut events = gatt.events();

    gatt.connect().unwrap();
    expect_connected(&mut events).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    transport
        .last_handle()
        .unwrap()
        .simulate_disconnect(GattStatus::ERROR);
    next_event(&mut events).await;
    expect_connected(&mut events).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(transport.handles().len(), 2);
}

#[tokio::test]
async fn test_on_connect_connection_loss_retries() {
    let transport = Arc::new(FakeTransport::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let gatt = KeepAliveGatt::builder(transport.clone(), test_device())
        .config(test_config())
        .on_connect(move |_gatt| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if run == 0 {
                    Err(GattError::connection_lost(None))
                } else {
                    Ok(())
                }
            }
        })
        .build()
        .unwrap();
    let mut events = gatt.events();

    gatt.connect().unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        KeepAliveEvent::Disconnected {
            was_connected: false,
            connection_attempt: 1
        }
    ));
    expect_connected(&mut events).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_on_connect_failure_stops_supervisor() {
    let transport = Arc::new(FakeTransport::new());
    let failure = GattError::StatusFailure {
        operation: GattOperation::DiscoverServices,
        status: GattStatus::ERROR,
    };
    let returned = failure.clone();
    let gatt = KeepAliveGatt::builder(transport.clone(), test_device())
        .config(test_config())
        .on_connect(move |_gatt| {
            let returned = returned.clone();
            async move { Err(returned) }
        })
        .build()
        .unwrap();

    gatt.connect().unwrap();
    let settled = wait_for_state(&gatt, KeepAliveState::is_cancelled).await;
    assert_eq!(settled, KeepAliveState::Cancelled(Some(failure)));

    let handle = transport.last_handle().unwrap();
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(transport.connect_calls(), 1);

    // A stopped supervisor refuses to start again
    assert!(gatt.is_cancelled());
    let refused = assert_err!(gatt.connect());
    assert!(matches!(refused, GattError::Cancelled { .. }));
    gatt.disconnect();
    assert_err!(gatt.connect());
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_event_handler_error_stops_supervisor() {
    let transport = Arc::new(FakeTransport::new());
    let gatt = KeepAliveGatt::builder(transport.clone(), test_device())
        .config(test_config())
        .on_event(|event| async move {
            match event {
                KeepAliveEvent::Connected(_) => Err(GattError::transform("refused by handler")),
                _ => Ok(()),
            }
        })
        .build()
        .unwrap();

    gatt.connect().unwrap();
    let settled = wait_for_state(&gatt, KeepAliveState::is_cancelled).await;
    assert_eq!(
        settled,
        KeepAliveState::Cancelled(Some(GattError::transform("refused by handler")))
    );
    assert_eq!(transport.last_handle().unwrap().disconnect_calls(), 1);
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_registry_keeps_one_connection_per_device() {
    let transport = Arc::new(FakeTransport::new());
    let registry = GattRegistry::new();
    assert!(registry.is_empty());

    let first = registry.get_or_insert_with(test_device(), || supervised(&transport));
    let again = registry.get_or_insert_with(test_device(), || supervised(&transport));
    assert!(Arc::ptr_eq(&first, &again));

    let other = assert_ok!(
        registry.get_or_try_insert_with(DeviceId::new("AA:BB:CC:DD:EE:11"), || {
            KeepAliveGatt::builder(transport.clone(), DeviceId::new("AA:BB:CC:DD:EE:11"))
                .config(test_config())
                .build()
        })
    );
    assert_eq!(registry.len(), 2);
    assert!(registry.get(other.device()).is_some());

    let removed = registry.remove(&test_device()).unwrap();
    assert!(removed.is_cancelled());
    wait_for_state(&removed, KeepAliveState::is_cancelled).await;
    assert_eq!(registry.len(), 1);
    assert!(registry.get(&test_device()).is_none());
}
