use qsync::config::Config;
use qsync::streaming::{run_receiver, BincodeCodec, Receiver, ReceiverConfig};
use qsync::transport::quic::QuicServer;
use qsync::transport::PasswordAuthority;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_with_shared_password() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    fs::create_dir(src.path().join("sub")).unwrap();
    fs::write(src.path().join("sub/a.txt"), "over quic").unwrap();

    let config = Config::default();
    let authority = PasswordAuthority::derive("open sesame").unwrap();
    let server = QuicServer::bind("127.0.0.1:0".parse().unwrap(), Some(&authority), &config).unwrap();
    let addr = server.local_addr().unwrap();

    let root = dst.path().to_path_buf();
    let receiver_config = ReceiverConfig::new(&root, &config);
    let serving = tokio::spawn(async move {
        let conn = server.accept().await.unwrap().unwrap();
        let receiver = Receiver::new(receiver_config, Arc::new(BincodeCodec)).unwrap();
        run_receiver(Arc::new(conn), Arc::new(receiver)).await
    });

    let sent = qsync::server::push(addr, src.path(), None, Some("open sesame"), &config)
        .await
        .unwrap();
    assert_eq!(sent.pulls_served, 1);
    let received = serving.await.unwrap().unwrap();
    assert_eq!(received.files_ok, 1);
    assert_eq!(
        fs::read_to_string(dst.path().join("sub/a.txt")).unwrap(),
        "over quic"
    );
}

#[tokio::test]
async fn test_push_with_wrong_password_fails() {
    let src = TempDir::new().unwrap();
    fs::write(src.path().join("a.txt"), "secret").unwrap();

    let config = Config::default();
    let authority = PasswordAuthority::derive("open sesame").unwrap();
    let server = QuicServer::bind("127.0.0.1:0".parse().unwrap(), Some(&authority), &config).unwrap();
    let addr = server.local_addr().unwrap();
    let _serving = tokio::spawn(async move { server.accept().await.map(|r| r.is_ok()) });

    let err = qsync::server::push(addr, src.path(), None, Some("open sesame!"), &config)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to connect"), "{:#}", err);
}

#[tokio::test]
async fn test_fingerprint_and_password_are_exclusive() {
    let src = TempDir::new().unwrap();
    let config = Config::default();
    let fp = "00".repeat(32);
    let err = qsync::server::push(
        "127.0.0.1:9".parse().unwrap(),
        src.path(),
        Some(&fp),
        Some("pw"),
        &config,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("cannot be combined"));
}
