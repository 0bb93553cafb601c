mod common;

use std::time::Duration;

use common::{DriveEnd, Type4Tag, URI_RECORD, connect, drive, start_runtime, wait_for_stats};
use hce_core::{
    channel::{ChannelState, NdefMessage, NdefRecord, Tnf},
    connection::ConnectionState,
    tag::DeactivationReason,
};

#[tokio::test]
async fn test_handshake_publishes_one_event() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut stats = runtime.subscribe_stats();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);

    connect(&mut service);
    let watched = stats.clone();
    let end = drive(&mut service, &mut tag, || watched.borrow().settled() >= 1).await;
    assert_eq!(end, DriveEnd::Done);
    assert_eq!(wait_for_stats(&mut stats, |s| s.settled() >= 1).await.established, 1);

    let handle = events.recv().await.unwrap();
    assert!(events.try_recv().is_err());

    let raw = runtime.resolver().raw_channel(&handle).unwrap();
    let record = runtime.resolver().record_channel(&handle).unwrap();
    assert_eq!(Some(raw.id()), service.raw_channel().map(|c| c.id()));
    assert_eq!(record.raw().id(), raw.id());
    assert_eq!(record.records().records()[0].payload, b"opensk.dev/");
    assert_eq!(
        runtime.registry().state(handle.session_id()),
        Some(ConnectionState::Established)
    );
}

#[tokio::test]
async fn test_failed_record_read_publishes_nothing() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut stats = runtime.subscribe_stats();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::unformatted();

    connect(&mut service);
    let watched = stats.clone();
    drive(&mut service, &mut tag, || watched.borrow().settled() >= 1).await;

    let settled = wait_for_stats(&mut stats, |s| s.settled() >= 1).await;
    assert_eq!((settled.failed, settled.established), (1, 0));
    assert!(events.try_recv().is_err());
    assert!(runtime.registry().is_empty());

    // the raw channel stays up until its own deactivation
    let raw = service.raw_channel().unwrap();
    assert_eq!(raw.state(), ChannelState::Open);
    service.on_deactivated(DeactivationReason::LINK_LOSS);
    assert_eq!(raw.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_link_loss_disconnects_established_connection() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);

    connect(&mut service);
    let watched = runtime.subscribe_stats();
    drive(&mut service, &mut tag, || watched.borrow().established >= 1).await;
    let handle = events.recv().await.unwrap();
    let record = runtime.resolver().record_channel(&handle).unwrap();

    service.on_deactivated(DeactivationReason(2));

    assert_eq!(record.state(), ChannelState::Disconnected);
    assert!(!record.force_disconnect());
    assert_eq!(record.state(), ChannelState::Disconnected);
    assert_eq!(
        runtime.registry().state(handle.session_id()),
        Some(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn test_uninitialized_service_rejects_everything() {
    let runtime = start_runtime("F00102XYZ");
    let mut service = runtime.create_service();
    assert!(!service.is_initialized());

    let select = hce_core::apdu::commands::select_by_name(&hex::decode(common::AID).unwrap());
    for apdu in [select.to_bytes(), vec![0x80, 0x10, 0x00, 0x00], vec![], vec![0xFF]] {
        assert_eq!(service.process_command_apdu(&apdu), vec![0x6A, 0x81]);
    }
    service.on_deactivated(DeactivationReason::LINK_LOSS);
    assert!(service.raw_channel().is_none());
}

#[tokio::test]
async fn test_internal_fault_yields_empty_response() {
    let runtime = start_runtime(common::AID);
    let mut service = runtime.create_service();
    connect(&mut service);
    let raw = service.raw_channel().unwrap();

    // a response with no command in flight
    let response = service.process_command_apdu(&[0x80, 0x12, 0x00, 0x00, 0x02, 0x90, 0x00]);
    assert!(response.is_empty());
    assert_eq!(raw.state(), ChannelState::Disconnected);

    // distinguishable from the uninitialized status word
    assert_ne!(response, vec![0x6A, 0x81]);
}

#[tokio::test]
async fn test_concurrent_connections_get_distinct_sessions() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut first = runtime.create_service();
    let mut second = runtime.create_service();
    let mut first_tag = Type4Tag::new(URI_RECORD);
    let mut second_tag = Type4Tag::new(&[]);

    connect(&mut first);
    connect(&mut second);

    let watched = runtime.subscribe_stats();
    drive(&mut second, &mut second_tag, || watched.borrow().established >= 1).await;
    drive(&mut first, &mut first_tag, || watched.borrow().established >= 2).await;

    let second_handle = events.recv().await.unwrap();
    let first_handle = events.recv().await.unwrap();
    assert_ne!(first_handle.session_id(), second_handle.session_id());

    let resolver = runtime.resolver();
    assert_eq!(
        resolver.raw_channel(&first_handle).map(|c| c.id()),
        first.raw_channel().map(|c| c.id())
    );
    assert_eq!(
        resolver.raw_channel(&second_handle).map(|c| c.id()),
        second.raw_channel().map(|c| c.id())
    );
    assert!(resolver.record_channel(&second_handle).unwrap().records().is_empty());
    assert_eq!(resolver.record_channel(&first_handle).unwrap().records().records().len(), 1);
}

#[tokio::test]
async fn test_forced_disconnect_before_establishment() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut stats = runtime.subscribe_stats();
    let mut service = runtime.create_service();

    connect(&mut service);
    let raw = service.raw_channel().unwrap();
    assert!(raw.force_disconnect());

    let settled = wait_for_stats(&mut stats, |s| s.settled() >= 1).await;
    assert_eq!(settled.cancelled, 1);
    assert!(events.try_recv().is_err());
    assert!(runtime.registry().is_empty());
}

#[tokio::test]
async fn test_destroyed_service_entry_is_reclaimed() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut stats = runtime.subscribe_stats();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);

    connect(&mut service);
    let watched = stats.clone();
    drive(&mut service, &mut tag, || watched.borrow().established >= 1).await;
    let handle = events.recv().await.unwrap();
    assert!(runtime.resolver().raw_channel(&handle).is_some());
    let owner = service.owner();
    assert!(runtime.registry().is_live(owner));

    service.on_destroy();
    wait_for_stats(&mut stats, |s| s.retired >= 1).await;
    assert!(!runtime.registry().is_live(owner));
    assert!(runtime.registry().is_empty());
    assert!(runtime.resolver().raw_channel(&handle).is_none());
    assert!(runtime.resolver().record_channel(&handle).is_none());
}

#[tokio::test]
async fn test_reconnect_replaces_entry_and_keeps_prior_channel() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);
    let watched = runtime.subscribe_stats();

    connect(&mut service);
    drive(&mut service, &mut tag, || watched.borrow().established >= 1).await;
    let prior = events.recv().await.unwrap();
    let prior_raw = runtime.resolver().raw_channel(&prior).unwrap();

    connect(&mut service);
    drive(&mut service, &mut tag, || watched.borrow().established >= 2).await;
    let current = events.recv().await.unwrap();

    assert!(runtime.resolver().raw_channel(&prior).is_none());
    let current_raw = runtime.resolver().raw_channel(&current).unwrap();
    assert_ne!(prior_raw.id(), current_raw.id());
    assert_eq!(prior_raw.state(), ChannelState::Open);

    service.on_deactivated(DeactivationReason::DESELECTED);
    assert_eq!(prior_raw.state(), ChannelState::Disconnected);
    assert_eq!(current_raw.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_records_written_through_record_channel() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);
    let watched = runtime.subscribe_stats();

    connect(&mut service);
    drive(&mut service, &mut tag, || watched.borrow().established >= 1).await;
    let handle = events.recv().await.unwrap();
    let record = runtime.resolver().record_channel(&handle).unwrap();

    let message = NdefMessage::new(vec![NdefRecord::new(Tnf::WellKnown, b"T".to_vec(), vec![0x41; 300])]);
    let expected = message.to_bytes().unwrap();
    let writer = tokio::spawn(async move { record.write_records(&message).await });

    drive(&mut service, &mut tag, || writer.is_finished()).await;
    writer.await.unwrap().unwrap();
    assert_eq!(tag.message(), expected.as_slice());
}

#[tokio::test]
async fn test_protocol_level_close() {
    let runtime = start_runtime(common::AID);
    let (_, mut events) = runtime.events().subscribe_channel();
    let mut service = runtime.create_service();
    let mut tag = Type4Tag::new(URI_RECORD);
    let watched = runtime.subscribe_stats();

    connect(&mut service);
    drive(&mut service, &mut tag, || watched.borrow().established >= 1).await;
    let handle = events.recv().await.unwrap();
    let record = runtime.resolver().record_channel(&handle).unwrap();

    let closing = record.clone();
    let close = tokio::spawn(async move { closing.disconnect().await });
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(drive(&mut service, &mut tag, || false).await, DriveEnd::Closed);
    assert_eq!(close.await.unwrap(), ChannelState::Disconnected);
    assert!(service.raw_channel().is_none());
}
