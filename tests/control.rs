mod common;

use common::*;
use rustmidea::frame::Frame;
use rustmidea::{
    Command, DesiredState, Device, DeviceDescriptor, DeviceType, MideaError, OperationalMode,
    ProtocolVersion, SessionConfig, SessionState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> SessionConfig {
    SessionConfig::default()
        .with_settle_delay(Duration::ZERO)
        .with_command_timeout(Duration::from_millis(500))
}

fn v2_device(appliance: &FakeAppliance, config: SessionConfig) -> Device {
    let descriptor = DeviceDescriptor::new(
        DEVICE_ID,
        localhost(),
        appliance.port(),
        DeviceType::AirConditioner,
        ProtocolVersion::V2,
    )
    .unwrap();
    Device::new(descriptor, config).unwrap()
}

fn v3_device(appliance: &FakeAppliance, config: SessionConfig) -> Device {
    let descriptor = DeviceDescriptor::new(
        V3_DEVICE_ID,
        localhost(),
        appliance.port(),
        DeviceType::AirConditioner,
        ProtocolVersion::V3,
    )
    .unwrap()
    .with_credentials(TOKEN.to_vec(), key())
    .unwrap();
    Device::new(descriptor, config).unwrap()
}

#[tokio::test]
async fn v2_refresh_reuses_the_connection() {
    let appliance = FakeAppliance::v2(state_responder()).await;
    let mut device = v2_device(&appliance, config());

    let state = device.refresh().await.unwrap();
    assert!(state.power_on);
    assert_eq!(state.operational_mode, OperationalMode::Cool);
    assert_eq!(state.target_temperature, 21.0);

    device.refresh().await.unwrap();
    assert_eq!(appliance.connections(), 1);
    assert_eq!(device.session_state(), SessionState::Ready);
    assert!(device.online());

    let requests = appliance.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0][0], 0x41);
}

#[tokio::test]
async fn v3_status_query() {
    let appliance = FakeAppliance::v3(state_responder()).await;
    let mut device = v3_device(&appliance, config());

    let state = device.send_command(&Command::GetState).await.unwrap();
    assert!(state.power_on);
    assert!(state.eco_mode);
    assert_eq!(device.session_state(), SessionState::Ready);
}

#[tokio::test]
async fn v3_apply_sends_control_frame() {
    let appliance = FakeAppliance::v3(state_responder()).await;
    let mut device = v3_device(&appliance, config());

    let desired = DesiredState::default()
        .with_power(true)
        .with_mode(OperationalMode::Cool)
        .with_target_temperature(21.0);
    assert!(device.apply(&desired).await.unwrap().power_on);

    let requests = appliance.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0][0], 0x40);
}

#[tokio::test]
async fn rejected_handshake_is_retried_once_by_default() {
    let appliance = FakeAppliance::v3_rejecting().await;
    let mut device = v3_device(&appliance, SessionConfig::default());

    assert!(matches!(
        device.connect().await,
        Err(MideaError::Handshake(_))
    ));
    assert_eq!(device.session_state(), SessionState::Disconnected);
    assert!(!device.online());
    assert_eq!(appliance.connections(), 2);
}

#[tokio::test]
async fn rejected_handshake_gives_up_after_configured_attempts() {
    let appliance = FakeAppliance::v3_rejecting().await;
    let mut device = v3_device(&appliance, config().with_max_handshake_retries(3));

    assert!(matches!(
        device.connect().await,
        Err(MideaError::Handshake(_))
    ));
    assert_eq!(device.session_state(), SessionState::Disconnected);
    assert_eq!(appliance.connections(), 3);
}

#[tokio::test]
async fn corrupted_checksum_keeps_previous_state() {
    let responder = Arc::new(|frame: &Frame| {
        if frame.body[0] == 0x40 {
            let mut corrupt = state_frame();
            let last = corrupt.len() - 1;
            corrupt[last] ^= 0xFF;
            Reply::Frame(corrupt)
        } else {
            Reply::Frame(state_frame())
        }
    });
    let appliance = FakeAppliance::v3(responder).await;
    let mut device = v3_device(&appliance, config());

    device.refresh().await.unwrap();
    let before = device.state().clone();

    let result = device
        .apply(&DesiredState::default().with_power(false))
        .await;
    assert!(matches!(result, Err(MideaError::Frame(_))));
    assert_eq!(device.state(), &before);
    assert_eq!(device.session_state(), SessionState::Disconnected);

    // The next command reconnects
    device.refresh().await.unwrap();
    assert_eq!(appliance.connections(), 2);
}

#[tokio::test]
async fn silent_device_times_out() {
    let appliance = FakeAppliance::v2(Arc::new(|_: &Frame| Reply::Silent)).await;
    let mut device = v2_device(
        &appliance,
        config().with_command_timeout(Duration::from_millis(200)),
    );

    assert!(matches!(device.refresh().await, Err(MideaError::Timeout)));
    assert_eq!(device.session_state(), SessionState::Disconnected);
    assert!(!device.online());
}

#[tokio::test]
async fn closed_connection_is_a_connection_error() {
    let appliance = FakeAppliance::v2(Arc::new(|_: &Frame| Reply::Close)).await;
    let mut device = v2_device(&appliance, config());

    assert!(matches!(
        device.refresh().await,
        Err(MideaError::Connection(_))
    ));
    assert_eq!(device.session_state(), SessionState::Disconnected);
}

#[tokio::test]
async fn cancellation_aborts_a_pending_request() {
    // Ignores the first request only
    let answered = AtomicBool::new(false);
    let appliance = FakeAppliance::v2(Arc::new(move |_: &Frame| {
        if answered.swap(true, Ordering::SeqCst) {
            Reply::Frame(state_frame())
        } else {
            Reply::Silent
        }
    }))
    .await;
    let token = CancellationToken::new();
    let mut device = v2_device(
        &appliance,
        config().with_command_timeout(Duration::from_secs(10)),
    )
    .with_cancellation_token(token.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), device.refresh())
        .await
        .expect("cancellation did not interrupt the request");
    assert!(matches!(result, Err(MideaError::Cancelled)));
    assert_eq!(device.session_state(), SessionState::Disconnected);

    device.set_cancellation_token(None);
    assert!(device.refresh().await.unwrap().power_on);
    assert_eq!(appliance.connections(), 2);
}

#[tokio::test]
async fn expired_connections_are_replaced() {
    let appliance = FakeAppliance::v2(state_responder()).await;
    let mut device = v2_device(
        &appliance,
        config().with_max_connection_lifetime(Some(Duration::ZERO)),
    );

    device.refresh().await.unwrap();
    device.refresh().await.unwrap();
    assert_eq!(appliance.connections(), 2);
}

#[tokio::test]
async fn unreachable_device_is_offline() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let descriptor = DeviceDescriptor::new(
        DEVICE_ID,
        localhost(),
        port,
        DeviceType::AirConditioner,
        ProtocolVersion::V2,
    )
    .unwrap()
    .with_online(true);
    let mut device = Device::new(descriptor, config()).unwrap();

    assert!(matches!(
        device.refresh().await,
        Err(MideaError::Connection(_))
    ));
    assert!(!device.online());
}

#[tokio::test]
async fn failed_display_toggle_marks_device_offline() {
    let appliance = FakeAppliance::v2(Arc::new(|_: &Frame| Reply::Close)).await;
    let descriptor = DeviceDescriptor::new(
        DEVICE_ID,
        localhost(),
        appliance.port(),
        DeviceType::AirConditioner,
        ProtocolVersion::V2,
    )
    .unwrap()
    .with_online(true);
    let mut device = Device::new(descriptor, config()).unwrap();

    assert!(matches!(
        device.toggle_display(false).await,
        Err(MideaError::Connection(_))
    ));
    assert!(!device.online());
}

#[tokio::test]
async fn display_toggle_is_followed_by_refresh() {
    let appliance = FakeAppliance::v2(state_responder()).await;
    let mut device = v2_device(&appliance, config());

    assert!(device.toggle_display(true).await.unwrap().power_on);
    assert!(device.online());
    assert_eq!(appliance.requests().len(), 2);
}
