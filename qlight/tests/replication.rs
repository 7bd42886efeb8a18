//! End to end: a full node backed by tessera ships block private data to a light client.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::{Arc, Once};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pvt_common::{Block, EncryptedPayloadHash, Hash, PrivateStateIdentifier, Transaction, TransactionKind};
use pvt_ptm::engine::CachingProxy;
use pvt_ptm::{
    connect, new_private_state_manager, MemoryStateRootStore, PrivateStateManager, PrivateStateRootStore,
    PrivateTransactionManager, PtmConfig,
};
use pvt_qlight::{BlockDataResolver, CachingBlockPrivateDataResolver, ClientCache, PrivateBlockDataResolver};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("pvt_ptm=debug,pvt_qlight=debug")
            .with_test_writer()
            .try_init();
    });
}

async fn tessera() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/upcheck"))
        .respond_with(ResponseTemplate::new(200).set_body_string("I'm up!"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("21.7.0"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/version/api"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"["1.0","2.0"]"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/transaction/[^/]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "payload": BASE64.encode(b"secret"),
            "managedParties": [],
            "senderKey": "AAA",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/transaction/[^/]+/isSender$"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .mount(&server)
        .await;
    server
}

fn block(payload_hash: &EncryptedPayloadHash) -> Block {
    Block {
        number: 42,
        hash: Hash::from_string("block-42"),
        root: Hash::from_string("public-root-42"),
        transactions: vec![
            Transaction {
                hash: Hash::from_string("public-tx"),
                kind: TransactionKind::Public,
                data: Vec::new(),
            },
            Transaction {
                hash: Hash::from_string("private-tx"),
                kind: TransactionKind::Private,
                data: payload_hash.as_bytes().to_vec(),
            },
        ],
    }
}

#[tokio::test]
async fn test_light_client_receives_without_asking_server() {
    init_test_logging();
    let server = tessera().await;
    let payload_hash = EncryptedPayloadHash::from_slice(&[7u8; 64]);
    let block = block(&payload_hash);
    let private_root = Hash::from_string("private-root-42");

    // full node
    let ptm = connect(&PtmConfig::with_http_url(server.uri())).await.unwrap().into_shared();
    assert_eq!(ptm.name(), "Tessera");
    let server_store = Arc::new(MemoryStateRootStore::new());
    server_store.write_private_state_root(block.root, PrivateStateIdentifier::default_psi(), private_root);
    let psm = new_private_state_manager(Arc::clone(&ptm), server_store).await.unwrap();
    assert!(!psm.is_mps());
    let resolver = CachingBlockPrivateDataResolver::new(BlockDataResolver::new(psm, ptm));

    let psi = PrivateStateIdentifier::default_psi();
    let data = resolver
        .prepare_block_private_data(&block, &psi)
        .await
        .unwrap()
        .expect("node is party to the private transaction");
    // served from cache, tessera sees a single receive
    assert_eq!(resolver.prepare_block_private_data(&block, &psi).await.unwrap(), Some(data.clone()));
    assert_eq!(data.private_state_root, private_root);
    assert_eq!(data.private_transactions.len(), 1);
    assert!(data.private_transactions[0].is_sender);

    // light client
    let proxy = Arc::new(CachingProxy::new());
    let client_store = Arc::new(MemoryStateRootStore::new());
    let client = ClientCache::new(proxy.clone(), client_store.clone());
    client.add_private_block(&data).unwrap();

    let received = proxy.receive(&payload_hash).await.unwrap().unwrap();
    assert_eq!(received.payload, b"secret");
    assert_eq!(received.sender(), "AAA");
    assert!(proxy.is_sender(&payload_hash).await.unwrap());

    client_store.write_private_state_root(block.root, psi, private_root);
    client.validate_private_state_root(block.hash, block.root).unwrap();
}

#[tokio::test]
async fn test_light_client_skips_payloads_it_is_not_party_to() {
    init_test_logging();
    let proxy = Arc::new(CachingProxy::new());
    let client = ClientCache::new(proxy.clone(), Arc::new(MemoryStateRootStore::new()));
    let payload_hash = EncryptedPayloadHash::from_slice(&[9u8; 64]);

    client.check_and_add_empty_entry(payload_hash);
    assert_eq!(proxy.receive(&payload_hash).await.unwrap(), None);
    assert!(!proxy.is_sender(&payload_hash).await.unwrap());
}
