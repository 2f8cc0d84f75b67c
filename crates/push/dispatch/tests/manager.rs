mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use push_core::{
    DeviceType, DispatchError, InstallationQuery, Notification, ProviderEvent, ProviderKey,
    TransportError,
};
use push_dispatch::EntryState;

#[tokio::test]
async fn test_transmitted_event_carries_tenant() {
    let connector = FakeConnector::new();
    let manager = manager(
        [app("acme")],
        [installation("i1", "acme", DeviceType::Ios, "tok123")],
        connector.clone(),
    );
    let mut events = manager.subscribe();

    let report = manager
        .notify_by_id("i1", &Notification::alert("hi"))
        .await
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert!(report.devices_gone.is_empty());

    let event = expect_event(&mut events, |e| e.event.name() == "transmitted").await;
    assert_eq!(event.app_id, "acme");
    assert_eq!(event.device_type, DeviceType::Ios);
    match event.event {
        ProviderEvent::Transmitted {
            recipient,
            message_id,
            notification,
        } => {
            assert_eq!(recipient.as_deref(), Some("tok123"));
            assert_eq!(message_id.as_deref(), Some("id-tok123"));
            assert_eq!(notification.alert.as_deref(), Some("hi"));
            assert_eq!(notification.device_token.as_deref(), Some("tok123"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event.name(), "devicesGone");
    }
}

#[tokio::test]
async fn test_unregistered_token_reports_devices_gone() {
    let connector = FakeConnector::new();
    let manager = manager(
        [app("acme")],
        [installation("i9", "acme", DeviceType::Ios, "tok999")],
        connector,
    );
    let mut events = manager.subscribe();

    let report = manager
        .notify_by_id("i9", &Notification::alert("hi"))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.devices_gone, vec!["tok999".to_string()]);

    let error = expect_event(&mut events, |e| e.event.name() == "transmissionError").await;
    match error.event {
        ProviderEvent::TransmissionError { recipient, .. } => assert_eq!(recipient, "tok999"),
        other => panic!("unexpected event {other:?}"),
    }

    let gone = expect_event(&mut events, |e| e.event.name() == "devicesGone").await;
    assert_eq!(gone.app_id, "acme");
    assert_eq!(gone.device_type, DeviceType::Ios);
    match gone.event {
        ProviderEvent::DevicesGone { tokens, .. } => assert_eq!(tokens, vec!["tok999".to_string()]),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_auth_failure_rebuilds_provider() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme")], [], connector.clone());
    let key = ProviderKey::new("acme", DeviceType::Ios);
    let first = manager.cache().get(&key).await.unwrap().id();

    let expired = installation("i1", "acme", DeviceType::Ios, "auth-expired");
    let result = manager.notify(&expired, &Notification::alert("hi")).await;
    assert!(matches!(
        result,
        Err(DispatchError::Transport(TransportError::Auth(_)))
    ));
    assert_eq!(connector.connects(), 1);

    eventually(|| async { manager.cache().state(&key).await.is_none() }).await;

    let fresh = installation("i2", "acme", DeviceType::Ios, "tok123");
    let report = manager.notify(&fresh, &Notification::alert("hi")).await.unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(connector.connects(), 2);
    assert_ne!(manager.cache().get(&key).await.unwrap().id(), first);
}

#[tokio::test]
async fn test_fatal_error_is_isolated_to_its_tenant() {
    let connector = FakeConnector::new();
    let manager = Arc::new(manager([app("acme"), app("globex")], [], connector.clone()));

    let in_flight = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let slow = installation("g1", "globex", DeviceType::Ios, "slow-globex");
            manager.notify(&slow, &Notification::alert("hi")).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let expired = installation("a1", "acme", DeviceType::Ios, "auth-expired");
    assert!(manager.notify(&expired, &Notification::alert("hi")).await.is_err());
    let acme = ProviderKey::new("acme", DeviceType::Ios);
    eventually(|| async { manager.cache().state(&acme).await.is_none() }).await;

    connector.gate.notify_waiters();
    let report = in_flight.await.unwrap().unwrap();
    assert_eq!(report.transmitted, 1);

    let globex = ProviderKey::new("globex", DeviceType::Ios);
    assert_eq!(manager.cache().state(&globex).await, Some(EntryState::Ready));
    let next = installation("g2", "globex", DeviceType::Ios, "tok123");
    assert!(manager.notify(&next, &Notification::alert("again")).await.is_ok());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_validation_happens_before_provider_setup() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme")], [], connector.clone());

    let target = installation("i1", "acme", DeviceType::Ios, "tok123");
    let result = manager.notify(&target, &Notification::default()).await;
    assert!(matches!(result, Err(DispatchError::Validation(_))));

    let no_token = installation("i2", "acme", DeviceType::Ios, "");
    let result = manager.notify(&no_token, &Notification::alert("hi")).await;
    assert!(matches!(result, Err(DispatchError::Validation(_))));

    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_not_found() {
    let manager = manager([app("acme")], [], FakeConnector::new());

    let result = manager
        .notify_by_id("missing", &Notification::alert("hi"))
        .await;
    assert!(matches!(
        result,
        Err(DispatchError::NotFound {
            kind: "installation",
            ..
        })
    ));

    let stranger = installation("i1", "nobody", DeviceType::Ios, "tok123");
    let result = manager.notify(&stranger, &Notification::alert("hi")).await;
    assert!(matches!(
        result,
        Err(DispatchError::NotFound {
            kind: "application",
            ..
        })
    ));
}

#[tokio::test]
async fn test_notify_by_query_joins_every_branch() {
    let connector = FakeConnector::new();
    let manager = manager(
        [app("acme")],
        [
            installation("i1", "acme", DeviceType::Ios, "tok123"),
            installation("i2", "acme", DeviceType::Android, "reg-1"),
            installation("i3", "acme", DeviceType::Ios, "tok999"),
            installation("i4", "globex", DeviceType::Ios, "tok456"),
        ],
        connector.clone(),
    );

    let query = InstallationQuery {
        app_id: Some("acme".into()),
        ..Default::default()
    };
    let report = manager
        .notify_by_query(&query, &Notification::alert("hi"))
        .await
        .unwrap();

    assert_eq!(report.matched, 3);
    let ids: Vec<_> = report.results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["i1", "i2", "i3"]);

    assert_eq!(report.results[0].1.as_ref().unwrap().transmitted, 1);
    assert!(matches!(
        report.results[1].1,
        Err(DispatchError::Validation(_)) | Err(DispatchError::Construction { .. })
    ));
    assert_eq!(
        report.results[2].1.as_ref().unwrap().devices_gone,
        vec!["tok999".to_string()]
    );
    assert!(report.first_error().is_some());

    let mut sent = connector.sent();
    sent.sort();
    assert_eq!(sent, vec!["tok123", "tok999"]);
}

#[tokio::test]
async fn test_notify_many() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme")], [], connector.clone());

    let receipt = manager
        .notify_many(
            "acme",
            DeviceType::Ios,
            vec!["tok123".into(), "tok456".into(), "tok999".into()],
            &Notification::alert("hi"),
        )
        .await
        .unwrap();
    assert_eq!(receipt.len(), 3);

    let report = receipt.wait().await.unwrap();
    assert_eq!(report.transmitted, 2);
    assert_eq!(report.failed, 1);

    let empty = manager
        .notify_many("acme", DeviceType::Ios, vec![], &Notification::alert("hi"))
        .await;
    assert!(matches!(empty, Err(DispatchError::Validation(_))));
}

#[tokio::test]
async fn test_settings_changed_rebuilds() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme")], [], connector.clone());
    let target = installation("i1", "acme", DeviceType::Ios, "tok123");

    manager.notify(&target, &Notification::alert("one")).await.unwrap();
    assert!(manager.settings_changed("acme", DeviceType::Ios).await);
    assert!(!manager.settings_changed("acme", DeviceType::Web).await);
    assert!(manager.cache().is_empty().await);

    manager.notify(&target, &Notification::alert("two")).await.unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_cancelled_batch_is_skipped() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme")], [], connector.clone());
    manager.cancel_batch("spring-sale").await;

    let notification = Notification {
        batch_id: Some("spring-sale".into()),
        ..Notification::alert("hi")
    };
    let target = installation("i1", "acme", DeviceType::Ios, "tok123");
    let report = manager.notify(&target, &notification).await.unwrap();

    assert_eq!(report.cancelled, 1);
    assert!(connector.sent().is_empty());

    manager.forget_batch("spring-sale").await;
    let report = manager.notify(&target, &notification).await.unwrap();
    assert_eq!(report.transmitted, 1);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let connector = FakeConnector::new();
    let manager = manager([app("acme"), app("globex")], [], connector.clone());

    for app_id in ["acme", "globex"] {
        let target = installation("i", app_id, DeviceType::Ios, "tok123");
        manager.notify(&target, &Notification::alert("hi")).await.unwrap();
    }

    assert!(manager.shutdown().await);
    assert!(manager.shutdown().await);
    assert!(connector.all_closed());

    let target = installation("i", "acme", DeviceType::Ios, "tok123");
    let result = manager.notify(&target, &Notification::alert("hi")).await;
    assert!(matches!(result, Err(DispatchError::ShuttingDown)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notify_by_query_builds_providers_concurrently() {
    let connector = FakeConnector::with_delay(Duration::from_millis(300));
    let manager = manager(
        [app("acme"), app("globex"), app("initech")],
        [
            installation("a1", "acme", DeviceType::Ios, "tok1"),
            installation("g1", "globex", DeviceType::Ios, "tok2"),
            installation("n1", "initech", DeviceType::Ios, "tok3"),
        ],
        connector.clone(),
    );

    let started = Instant::now();
    let report = manager
        .notify_by_query(&InstallationQuery::default(), &Notification::alert("hi"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.matched, 3);
    assert!(report.first_error().is_none());
    assert_eq!(connector.connects(), 3);
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
}

#[tokio::test]
async fn test_notify_topic() {
    let connector = FakeConnector::new();
    let manager = manager([android_app("acme"), app("globex")], [], connector.clone());
    let mut events = manager.subscribe();

    let receipt = manager
        .notify_topic("acme", DeviceType::Android, "news", &Notification {
            message: Some("breaking".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(receipt.wait().await.unwrap().transmitted, 1);
    assert_eq!(connector.sent(), vec!["/topics/news"]);

    let event = expect_event(&mut events, |e| e.event.name() == "transmitted").await;
    assert_eq!(event.device_type, DeviceType::Android);

    let ios = manager
        .notify_topic("globex", DeviceType::Ios, "news", &Notification::alert("hi"))
        .await;
    assert!(matches!(ios, Err(DispatchError::Validation(_))));

    let blank = manager
        .notify_topic("acme", DeviceType::Android, "/topics/", &Notification::alert("hi"))
        .await;
    assert!(matches!(blank, Err(DispatchError::Validation(_))));
}

