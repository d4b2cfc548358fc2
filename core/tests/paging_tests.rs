use std::collections::BTreeSet;
use std::time::Duration;

use corvidmq::config::{AddressFullPolicy, AddressSettings};
use corvidmq::remoting::TransportContext;
use corvidmq::{BrokerConfig, BrokerServer, ClientConfig, ClientSessionFactory, Message};
use tempfile::{tempdir, TempDir};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

fn paged_config(dir: &TempDir, server_id: u32, address: &str, settings: AddressSettings) -> BrokerConfig {
    BrokerConfig {
        data_dir: dir.path().to_string_lossy().to_string(),
        ..BrokerConfig::in_vm(server_id)
    }
    .with_address_settings(address, settings)
}

fn limited(max_size_bytes: i64, policy: AddressFullPolicy) -> AddressSettings {
    AddressSettings {
        max_size_bytes,
        page_size_bytes: 2048,
        address_full_policy: policy,
        ..AddressSettings::default()
    }
}

fn padded(i: usize) -> String {
    format!("msg-{i:04}-{}", "x".repeat(100))
}

async fn start(config: BrokerConfig, context: &TransportContext) -> BrokerServer {
    let server = BrokerServer::with_context(config, context.clone()).unwrap();
    server.start().await.unwrap();
    server
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_paged_messages_delivered_in_order_and_pages_deleted() {
    let dir = tempdir().unwrap();
    let context = TransportContext::new();
    let server = start(
        paged_config(&dir, 31, "feed", limited(4096, AddressFullPolicy::Page)),
        &context,
    )
    .await;
    let config = ClientConfig {
        block_on_non_durable_send: true,
        ..ClientConfig::in_vm(31)
    };
    let factory = ClientSessionFactory::connect(config, context.clone()).await.unwrap();
    let session = factory.create_session().await.unwrap();
    session.create_queue("feed", "feed", None, false).await.unwrap();

    let producer = session.create_producer("feed").unwrap();
    for i in 0..100 {
        producer.send(Message::new("feed", padded(i))).await.unwrap();
    }

    let store = server.post_office().paging_store("feed").unwrap();
    assert!(store.is_paging());
    let peak = store.page_count();
    assert!(peak > 1, "expected several pages, got {peak}");
    assert!(store.page_store_bytes() > 0);
    assert!(server.metrics().snapshot().messages_paged > 0);
    assert!(store.address_size() <= 4096);
    let queue = server.post_office().queue("feed").unwrap();
    let resident = queue.message_count();
    assert!(resident > 0 && resident < 100, "resident {resident}");

    let consumer = session.create_consumer("feed").await.unwrap();
    session.start().unwrap();
    for i in 0..100 {
        let message = consumer
            .receive(RECEIVE_TIMEOUT)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("message {i} not received"));
        assert_eq!(String::from_utf8_lossy(message.body()), padded(i));
        consumer.acknowledge(&message).await.unwrap();
    }
    assert!(consumer.receive(Duration::from_millis(50)).await.unwrap().is_none());

    assert!(wait_until(|| queue.message_count() == 0).await);
    assert!(wait_until(|| store.page_count() < peak).await);

    factory.close().await;
    server.stop();
}

#[tokio::test]
async fn test_drop_policy_discards_when_full() {
    let dir = tempdir().unwrap();
    let context = TransportContext::new();
    let server = start(
        paged_config(&dir, 32, "lossy", limited(1024, AddressFullPolicy::Drop)),
        &context,
    )
    .await;
    let config = ClientConfig {
        block_on_non_durable_send: true,
        ..ClientConfig::in_vm(32)
    };
    let factory = ClientSessionFactory::connect(config, context.clone()).await.unwrap();
    let session = factory.create_session().await.unwrap();
    session.create_queue("lossy", "lossy", None, false).await.unwrap();

    let producer = session.create_producer("lossy").unwrap();
    for i in 0..30 {
        producer.send(Message::new("lossy", padded(i))).await.unwrap();
    }

    let queue = server.post_office().queue("lossy").unwrap();
    let kept = queue.message_count();
    assert!(kept > 0 && kept < 30, "kept {kept}");
    assert_eq!(server.metrics().snapshot().messages_dropped, (30 - kept) as u64);
    let store = server.post_office().paging_store("lossy").unwrap();
    assert!(!store.is_paging());
    assert_eq!(store.page_count(), 0);

    let consumer = session.create_consumer("lossy").await.unwrap();
    session.start().unwrap();
    for i in 0..kept {
        let message = consumer.receive(RECEIVE_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(message.body()), padded(i));
        consumer.acknowledge(&message).await.unwrap();
    }
    assert!(wait_until(|| queue.message_count() == 0).await);

    producer.send(Message::new("lossy", "after drain")).await.unwrap();
    let message = consumer.receive(RECEIVE_TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message.body().as_ref(), b"after drain");

    factory.close().await;
    server.stop();
}

#[tokio::test]
async fn test_block_policy_withholds_producer_credits() {
    let dir = tempdir().unwrap();
    let context = TransportContext::new();
    let server = start(
        paged_config(&dir, 33, "gated", limited(2048, AddressFullPolicy::Block)),
        &context,
    )
    .await;
    let config = ClientConfig {
        producer_window_size: 1024,
        ..ClientConfig::in_vm(33)
    };
    let factory = ClientSessionFactory::connect(config, context.clone()).await.unwrap();
    let admin = factory.create_session().await.unwrap();
    admin.create_queue("gated", "gated", None, false).await.unwrap();

    let sending = factory.create_session().await.unwrap();
    let sender = tokio::spawn(async move {
        let producer = sending.create_producer("gated")?;
        for i in 0..40 {
            producer.send(Message::new("gated", padded(i))).await?;
        }
        Ok::<_, corvidmq::CorvidError>(())
    });

    let store = server.post_office().paging_store("gated").unwrap();
    assert!(wait_until(|| store.deferred_credit_requests() > 0).await);
    assert!(!sender.is_finished());
    assert!(!store.is_paging());
    let queue = server.post_office().queue("gated").unwrap();
    assert!(queue.message_count() < 40);

    let consumer = admin.create_consumer("gated").await.unwrap();
    admin.start().unwrap();
    let mut received = Vec::new();
    for _ in 0..40 {
        let message = consumer.receive(RECEIVE_TIMEOUT).await.unwrap().unwrap();
        received.push(String::from_utf8_lossy(message.body()).to_string());
        consumer.acknowledge(&message).await.unwrap();
    }
    assert_eq!(received, (0..40).map(padded).collect::<Vec<_>>());

    tokio::time::timeout(Duration::from_secs(2), sender)
        .await
        .expect("sender released")
        .unwrap()
        .unwrap();

    factory.close().await;
    server.stop();
}

#[tokio::test]
async fn test_paged_durable_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let settings = limited(2048, AddressFullPolicy::Page);
    let server_config = BrokerConfig {
        persistence_enabled: true,
        ..paged_config(&dir, 34, "journal.paged", settings)
    };
    let client_config = ClientConfig {
        block_on_acknowledge: true,
        ..ClientConfig::in_vm(34)
    };

    let context = TransportContext::new();
    let server = start(server_config.clone(), &context).await;
    let factory = ClientSessionFactory::connect(client_config.clone(), context.clone())
        .await
        .unwrap();
    let session = factory.create_session().await.unwrap();
    session
        .create_queue("journal.paged", "journal.paged", None, true)
        .await
        .unwrap();
    let producer = session.create_producer("journal.paged").unwrap();
    for i in 0..30 {
        producer
            .send(Message::new("journal.paged", padded(i)).with_durable(true))
            .await
            .unwrap();
    }
    assert!(server.post_office().paging_store("journal.paged").unwrap().is_paging());

    let consumer = session.create_consumer("journal.paged").await.unwrap();
    session.start().unwrap();
    for i in 0..10 {
        let message = consumer.receive(RECEIVE_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(message.body()), padded(i));
        consumer.acknowledge(&message).await.unwrap();
    }
    factory.close().await;
    server.stop();
    drop(server);

    let context = TransportContext::new();
    let server = start(server_config, &context).await;
    let factory = ClientSessionFactory::connect(client_config, context.clone())
        .await
        .unwrap();
    let session = factory.create_session().await.unwrap();
    let consumer = session.create_consumer("journal.paged").await.unwrap();
    session.start().unwrap();

    let mut recovered = BTreeSet::new();
    while let Some(message) = consumer.receive(Duration::from_millis(500)).await.unwrap() {
        recovered.insert(String::from_utf8_lossy(message.body()).to_string());
        consumer.acknowledge(&message).await.unwrap();
    }
    let expected: BTreeSet<String> = (10..30).map(padded).collect();
    assert_eq!(recovered, expected);

    let queue = server.post_office().queue("journal.paged").unwrap();
    assert!(wait_until(|| queue.message_count() == 0).await);

    factory.close().await;
    server.stop();
}
