mod common;

use beam_core::{AppEvent, Compression, SendOptions, TransferError};
use common::*;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_every_pipeline_combination_round_trips() {
    let server = spawn_server(Some("pw")).await;
    let src = tempfile::tempdir().unwrap();
    let data = pattern(300_000);
    let client = client();

    for compression in [Compression::None, Compression::Gzip, Compression::Brotli] {
        for password in [None, Some("pw")] {
            let name = format!("{}_{}.bin", compression, password.is_some());
            let path = write_file(src.path(), &name, &data);

            let mut options = SendOptions::new("127.0.0.1", server.port()).with_compression(compression);
            if let Some(pw) = password {
                options = options.with_password(pw);
            }

            let outcome = client
                .send_file(&path, &options, &CancellationToken::new())
                .await
                .unwrap_or_else(|e| panic!("{}: {}", name, e));
            assert_eq!(outcome.original_size, data.len() as u64);
            assert_eq!(std::fs::read(server.path(&name)).unwrap(), data, "{}", name);
        }
    }
}

#[tokio::test]
async fn test_gzip_shrinks_repetitive_payload() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = vec![b'X'; 1024 * 1024];
    let path = write_file(src.path(), "xs.txt", &data);

    let options = SendOptions::new("127.0.0.1", server.port()).with_compression(Compression::Gzip);
    let outcome = client()
        .send_file(&path, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.wire_bytes * 100 < data.len() as u64, "{} wire bytes", outcome.wire_bytes);
    assert_eq!(std::fs::read(server.path("xs.txt")).unwrap(), data);
}

#[tokio::test]
async fn test_wrong_password_is_not_verified() {
    let server = spawn_server(Some("pw1")).await;
    let mut server_rx = server.events.subscribe();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "secret.bin", &pattern(100_000));

    let options = SendOptions::new("127.0.0.1", server.port()).with_password("pw2");
    let result = client()
        .send_file(&path, &options, &CancellationToken::new())
        .await;
    assert!(result.is_err());

    let event = wait_for(&mut server_rx, |e| {
        matches!(e, AppEvent::VerificationFailed { .. } | AppEvent::FileReceived { .. })
    })
    .await;
    assert!(matches!(event, AppEvent::VerificationFailed { .. }));
}

#[tokio::test]
async fn test_encrypted_send_to_receiver_without_password_rejected() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "secret.bin", b"classified");

    let options = SendOptions::new("127.0.0.1", server.port()).with_password("pw");
    let err = client()
        .send_file(&path, &options, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Rejected(_)));
    assert!(!server.path("secret.bin").exists());
}

#[tokio::test]
async fn test_missing_source_never_connects() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let err = client()
        .send_file(
            std::path::Path::new("/no/such/file.bin"),
            &SendOptions::new("127.0.0.1", port),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::MissingSource(_)));

    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "client connected despite missing source");
}

#[tokio::test]
async fn test_connection_refused_surfaces() {
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "a.bin", b"abc");
    let port = closed_port().await;

    let err = client()
        .send_file(&path, &SendOptions::new("127.0.0.1", port), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Connect { .. }));
}

#[tokio::test]
async fn test_directory_tree_recreated() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let root = src.path().join("album");
    write_file(&root, "cover.jpg", b"cover");
    write_file(&root, "2024/july/beach.jpg", b"beach");
    write_file(&root, "2024/notes.txt", b"notes");

    let report = client()
        .send_directory(&root, &SendOptions::new("127.0.0.1", server.port()), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.succeeded.len(), 3);

    assert_eq!(std::fs::read(server.path("album/cover.jpg")).unwrap(), b"cover");
    assert_eq!(std::fs::read(server.path("album/2024/july/beach.jpg")).unwrap(), b"beach");
    assert_eq!(std::fs::read(server.path("album/2024/notes.txt")).unwrap(), b"notes");
}

#[tokio::test]
async fn test_batch_continues_past_failure() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let a = write_file(src.path(), "a.txt", b"a");
    let b = write_file(src.path(), "b.txt", b"b");
    let missing = src.path().join("missing.txt");

    let report = client()
        .send_multiple_files(
            &[a, missing.clone(), b],
            &SendOptions::new("127.0.0.1", server.port()),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, missing);
    assert!(server.path("a.txt").exists());
    assert!(server.path("b.txt").exists());
}

#[tokio::test]
async fn test_events_on_both_sides() {
    let server = spawn_server(None).await;
    let mut server_rx = server.events.subscribe();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "report.pdf", &pattern(200_000));

    let client = client();
    let mut client_rx = client.events().subscribe();
    client
        .send_file(&path, &SendOptions::new("127.0.0.1", server.port()), &CancellationToken::new())
        .await
        .unwrap();

    let started = wait_for(&mut client_rx, |e| matches!(e, AppEvent::TransferStarted(_))).await;
    let AppEvent::TransferStarted(update) = started else { unreachable!() };
    assert_eq!(update.total_bytes, 200_000);
    assert_eq!(update.target_host, "127.0.0.1");

    let done = wait_for(&mut client_rx, |e| matches!(e, AppEvent::TransferCompleted(_))).await;
    let AppEvent::TransferCompleted(update) = done else { unreachable!() };
    assert_eq!(update.bytes_transferred, 200_000);

    let received = wait_for(&mut server_rx, |e| matches!(e, AppEvent::FileReceived { .. })).await;
    let AppEvent::FileReceived { file_name, size, sender, .. } = received else { unreachable!() };
    assert_eq!(file_name, "report.pdf");
    assert_eq!(size, 200_000);
    assert_eq!(sender, "127.0.0.1");
}

#[tokio::test]
async fn test_speed_limit_bounds_duration() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "slow.bin", &pattern(128 * 1024));

    let options = SendOptions::new("127.0.0.1", server.port()).with_speed_limit(64);
    let started = Instant::now();
    client()
        .send_file(&path, &options, &CancellationToken::new())
        .await
        .unwrap();

    // 128 KiB at 64 KiB/s
    assert!(started.elapsed() >= Duration::from_millis(1800), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_cancel_interrupts_throttled_send() {
    let server = spawn_server(None).await;
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "big.bin", &pattern(512 * 1024));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let options = SendOptions::new("127.0.0.1", server.port()).with_speed_limit(64);
    let started = Instant::now();
    let err = client().send_file(&path, &options, &cancel).await.unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3));
}
