//! End-to-end exchanges against a canned mock spamd.

#[cfg(feature = "async")]
mod async_client {
    use std::io::Read;
    use std::net::SocketAddr;

    use spamd_client::{AsyncClient, MessageClass, SpamdError, StatusCode, TellAction};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const MESSAGE: &str = "From: user@example.com\r\n\
        To: recipient@example.com\r\n\
        Subject: Test\r\n\
        \r\n\
        This is a test email.\r\n";

    /// Accept one connection, drain the request until the client half-closes,
    /// answer with the canned reply, and hand the request bytes back.
    async fn mock_spamd(reply: &'static [u8]) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (addr, handle)
    }

    fn client_for(addr: SocketAddr, user: &str, compression: bool) -> AsyncClient {
        AsyncClient::new("tcp", &addr.to_string(), user, compression).unwrap()
    }

    #[tokio::test]
    async fn check_over_tcp() {
        let (addr, server) =
            mock_spamd(b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\n").await;
        let client = client_for(addr, "exim", false);

        let reply = client.check(MESSAGE).await.unwrap();
        assert!(reply.is_spam);
        assert_eq!(reply.score, 7.3);
        assert_eq!(reply.base_score, 5.0);
        assert_eq!(reply.status_code, StatusCode::ExOk);
        assert!(reply.rules.is_empty());
        assert!(reply.raw.is_empty());

        let request = server.await.unwrap();
        let expected_head = format!(
            "CHECK SPAMC/1.5\r\nContent-length: {}\r\nUser: exim\r\n\r\n",
            MESSAGE.len() + 2
        );
        assert!(request.starts_with(expected_head.as_bytes()));
        let body = &request[expected_head.len()..];
        assert_eq!(body, format!("{MESSAGE}\r\n").as_bytes());
    }

    #[tokio::test]
    async fn compressed_body_is_zlib() {
        let (addr, server) =
            mock_spamd(b"SPAMD/1.5 0 EX_OK\r\nSpam: False ; 0.2 / 5.0\r\n\r\n").await;
        let client = client_for(addr, "", true);

        let reply = client.check(MESSAGE).await.unwrap();
        assert!(!reply.is_spam);

        let request = server.await.unwrap();
        let head_end = request.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = std::str::from_utf8(&request[..head_end]).unwrap();
        assert!(head.contains("Compress: zlib\r\n"));
        // Content-length advertises the uncompressed size.
        assert!(head.contains(&format!("Content-length: {}\r\n", MESSAGE.len() + 2)));

        // Body is zlib bytes followed by the trailing CRLF.
        let body = &request[head_end..request.len() - 2];
        let mut decoder = flate2::read::ZlibDecoder::new(body);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, MESSAGE);
        assert_eq!(&request[request.len() - 2..], b"\r\n");
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (addr, server) = mock_spamd(b"SPAMD/1.5 0 PONG\r\n").await;
        let client = client_for(addr, "exim", true);

        assert!(client.ping().await.unwrap());
        // PING frames no headers and no body.
        assert_eq!(server.await.unwrap(), b"PING SPAMC/1.5\r\n\r\n");
    }

    #[tokio::test]
    async fn symbols_over_tcp() {
        let (addr, _server) = mock_spamd(
            b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\nFOO,BAR,BAZ\n",
        )
        .await;
        let client = client_for(addr, "", false);

        let reply = client.symbols(MESSAGE).await.unwrap();
        let names: Vec<&str> = reply.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["FOO", "BAR", "BAZ"]);
        for rule in &reply.rules {
            assert!(rule.score.is_empty());
            assert!(rule.description.is_empty());
        }
    }

    #[tokio::test]
    async fn learn_sends_tell_headers() {
        let (addr, server) =
            mock_spamd(b"SPAMD/1.5 0 EX_OK\r\nDidSet: local\r\n\r\n").await;
        let client = client_for(addr, "", false);

        let reply = client.learn(MESSAGE, MessageClass::Spam).await.unwrap();
        assert_eq!(reply.headers.get("DidSet"), Some("local"));

        let request = server.await.unwrap();
        let head = std::str::from_utf8(&request).unwrap();
        assert!(head.starts_with("TELL SPAMC/1.5\r\n"));
        assert!(head.contains("Message-class: spam\r\n"));
        assert!(head.contains("Set: local\r\n"));
        assert!(!head.contains("Remove:"));
    }

    #[tokio::test]
    async fn tell_rejects_unset_class_before_dialing() {
        // The address is never dialed; any bytes on the wire would connect
        // to a port nothing listens on.
        let client = AsyncClient::new("tcp", "127.0.0.1:1", "exim", false).unwrap();
        let err = client
            .tell(MESSAGE, MessageClass::None, TellAction::Learn)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Set the correct learn type");
    }

    #[tokio::test]
    async fn unsized_body_fails_before_dialing() {
        let client = AsyncClient::new("tcp", "127.0.0.1:1", "", false).unwrap();
        let body = spamd_client::backend::async_client::Body::Unsized(Box::new(
            tokio::io::empty(),
        ));
        let err = client.check(body).await.unwrap_err();
        assert!(matches!(err, SpamdError::NoSize));
        assert_eq!(
            err.to_string(),
            "The content length could not be determined"
        );
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error_with_the_reply() {
        let (addr, _server) = mock_spamd(b"SPAMD/1.5 75 EX_TEMPFAIL\r\n\r\n").await;
        let client = client_for(addr, "", false);

        let err = client.check(MESSAGE).await.unwrap_err();
        assert!(err.is_temporary());
        match err {
            SpamdError::Status { reply } => {
                assert_eq!(reply.status_code, StatusCode::ExTempFail);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_closing_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let client = client_for(addr, "", false);
        let err = client.check(MESSAGE).await.unwrap_err();
        // Either the drain observes the reset or it yields zero bytes.
        match err {
            SpamdError::EmptyResponse | SpamdError::Io(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spamd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket
                .write_all(
                    b"SPAMD/1.5 0 EX_OK\r\n\
                      Spam: True ; 8.0 / 5.0\r\n\
                      \r\n\
                      Subject: [SPAM] Test\r\n\
                      \r\n\
                      body line\r\n",
                )
                .await
                .unwrap();
        });

        let client = AsyncClient::new("unix", path.to_str().unwrap(), "", false).unwrap();
        let reply = client.process(MESSAGE).await.unwrap();
        assert!(reply.is_spam);
        let message = reply.message.unwrap();
        assert_eq!(message.headers.get("subject"), Some("[SPAM] Test"));
        assert_eq!(message.body, b"body line\r\n");
    }

    #[tokio::test]
    async fn raw_body_capture_over_tcp() {
        let (addr, _server) = mock_spamd(
            b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\nFOO,BAR\n",
        )
        .await;
        let mut client = client_for(addr, "", false);
        client.config_mut().enable_raw_body();

        let reply = client.symbols(MESSAGE).await.unwrap();
        assert_eq!(reply.raw.as_ref(), b"FOO,BAR\n");
    }
}

#[cfg(feature = "sync")]
mod sync_client {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};

    use spamd_client::{StatusCode, SyncClient};

    const MESSAGE: &str = "From: user@example.com\r\n\
        To: recipient@example.com\r\n\
        Subject: Test\r\n\
        \r\n\
        This is a test email.\r\n";

    fn mock_spamd(reply: &'static [u8]) -> (SocketAddr, std::thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).unwrap();
            socket.write_all(reply).unwrap();
            request
        });
        (addr, handle)
    }

    #[test]
    fn check_over_tcp() {
        let (addr, server) =
            mock_spamd(b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\n");
        let client = SyncClient::new("tcp", &addr.to_string(), "exim", false).unwrap();

        let reply = client.check(MESSAGE).unwrap();
        assert!(reply.is_spam);
        assert_eq!(reply.status_code, StatusCode::ExOk);

        let request = server.join().unwrap();
        let head = std::str::from_utf8(&request).unwrap();
        assert!(head.starts_with("CHECK SPAMC/1.5\r\n"));
        assert!(head.contains(&format!("Content-length: {}\r\n", MESSAGE.len() + 2)));
        assert!(head.contains("User: exim\r\n"));
    }

    #[test]
    fn ping_over_tcp() {
        let (addr, server) = mock_spamd(b"SPAMD/1.5 0 PONG\r\n");
        let client = SyncClient::new("tcp", &addr.to_string(), "", false).unwrap();
        assert!(client.ping().unwrap());
        assert_eq!(server.join().unwrap(), b"PING SPAMC/1.5\r\n\r\n");
    }
}
