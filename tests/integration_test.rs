#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use regmaster::bundle::encode;
    use regmaster::{
        AcceptPolicy, Bundle, ClientConfig, Credentials, OperatorHandle,
        Phase, RegError, Server, ServerConfig, ServerEvent, ServerSubscriber,
        SessionId, SubmitterInfo, SubmitterSession, SubmitterState,
        DISCONNECT_SENTINEL,
    };
    use tempdir::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    const WAIT_LIMIT: Duration = Duration::from_secs(10);

    struct TestServer {
        operator: OperatorHandle,
        addr: SocketAddr,
        accept_loop: JoinHandle<regmaster::Result<()>>,
        docs: TempDir,
    }

    async fn start(policy: AcceptPolicy) -> TestServer {
        let docs = TempDir::new("regmaster").expect("Failed to create temporary directory");
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            docs_dir: docs.path().join("DocsDirectory"),
            accept_policy: policy,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.expect("Failed to bind");
        let addr = server.local_addr().unwrap();
        let operator = server.handle();
        let accept_loop = tokio::spawn(server.run());
        TestServer {
            operator,
            addr,
            accept_loop,
            docs,
        }
    }

    impl TestServer {
        fn client_config(&self) -> ClientConfig {
            ClientConfig::new(self.addr.to_string())
        }

        async fn stop(self) {
            self.operator.shutdown().await;
            self.accept_loop.await.unwrap().unwrap();
        }
    }

    /// Polls the registry until `check` holds for session `id`.
    async fn wait_for<F>(operator: &OperatorHandle, id: SessionId, check: F)
    where
        F: Fn(Option<Phase>) -> bool,
    {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let phase = operator.get(id).map(|session| session.phase);
                if check(phase) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session {id} never reached the state"));
    }

    async fn wait_for_sessions(operator: &OperatorHandle, count: usize) {
        tokio::time::timeout(WAIT_LIMIT, async {
            while operator.list().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions never registered");
    }

    fn jane() -> Bundle {
        let mut document = b"\xFF\xD8\xFF\xE0".to_vec();
        document.extend((0..5000u32).map(|i| (i % 251) as u8));
        Bundle::new(
            document,
            "id.jpg",
            SubmitterInfo::new("Jane Doe", "Tech U", "555-0100"),
        )
    }

    /// Announcement followed by the encoded bundle, as a submitter sends it.
    fn upload(bundle: &Bundle) -> Vec<u8> {
        let encoded = encode(bundle).unwrap();
        let mut bytes = encoded.len().to_string().into_bytes();
        bytes.extend_from_slice(&encoded);
        bytes
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ServerEvent>>,
    }

    impl ServerSubscriber for Recorder {
        fn get_id(&self) -> String {
            "recorder".to_owned()
        }

        fn log(&self, _message: String) {}

        fn notify(&self, event: ServerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_credentials_reach_the_submitter() {
        let server = start(AcceptPolicy::AwaitRegistration).await;
        let recorder = Arc::new(Recorder::default());
        server.operator.subscribe(recorder.clone());

        let config = server.client_config();
        let submitter = tokio::spawn(async move {
            let mut session = SubmitterSession::new(config);
            session.connect().await.unwrap();
            let response = session.submit(&jane()).await;
            (response, session.state())
        });

        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        wait_for(&server.operator, id, |phase| phase == Some(Phase::Complete))
            .await;

        let snapshot = server.operator.get(id).unwrap();
        let expected = jane();
        assert_eq!(snapshot.document_name.as_deref(), Some("id.jpg"));
        assert_eq!(snapshot.submitter.as_ref(), Some(expected.submitter()));
        assert_eq!(snapshot.received_size, snapshot.announced_size);

        let stored = server
            .docs
            .path()
            .join("DocsDirectory")
            .join(format!("session-{id}"))
            .join("id.jpg");
        assert_eq!(snapshot.stored_at.as_deref(), Some(stored.as_path()));
        assert_eq!(std::fs::read(&stored).unwrap(), expected.document_bytes());

        let credentials = Credentials::new("jdoe", "x7Q!").unwrap();
        server
            .operator
            .issue_credentials(id, &credentials)
            .await
            .unwrap();

        let (response, state) = submitter.await.unwrap();
        assert_eq!(response.unwrap(), credentials.message());
        assert_eq!(state, SubmitterState::Closed);

        assert!(server.operator.get(id).is_none());
        assert!(matches!(
            server.operator.respond(id, "again").await,
            Err(RegError::SessionNotFound(_))
        ));

        let events = recorder.events.lock().unwrap().clone();
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Completed { id: done, .. } if *done == id)));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Responded { id: done, .. } if *done == id)));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_withdrawn_submitter_leaves_no_session() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let mut session = SubmitterSession::new(server.client_config());
        session.connect().await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;

        session.disconnect().await.unwrap();
        wait_for(&server.operator, id, |phase| phase.is_none()).await;

        assert!(matches!(
            server.operator.respond(id, "too late").await,
            Err(RegError::SessionNotFound(_))
        ));
        let session_dir = server
            .docs
            .path()
            .join("DocsDirectory")
            .join(format!("session-{id}"));
        assert!(!session_dir.exists());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_size_header_is_flagged() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        wait_for(&server.operator, id, |phase| phase == Some(Phase::Flagged))
            .await;

        assert!(server
            .operator
            .get(id)
            .unwrap()
            .flag_reason
            .unwrap()
            .contains("hello"));
        assert!(matches!(
            server.operator.respond(id, "creds").await,
            Err(RegError::SessionNotReady(_))
        ));

        server.operator.disconnect(id).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, DISCONNECT_SENTINEL.as_bytes());
        assert!(server.operator.get(id).is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_fault_on_one_session_spares_the_others() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let mut broken = TcpStream::connect(server.addr).await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let broken_id = server.operator.list()[0].id;

        let config = server.client_config();
        let submitter = tokio::spawn(async move {
            let mut session = SubmitterSession::new(config);
            session.connect().await.unwrap();
            session.submit(&jane()).await
        });
        wait_for_sessions(&server.operator, 2).await;
        let good_id = server
            .operator
            .list()
            .iter()
            .map(|s| s.id)
            .find(|id| *id != broken_id)
            .unwrap();

        // announce far more than is ever sent, then vanish
        broken.write_all(b"100000RMB").await.unwrap();
        broken.shutdown().await.unwrap();
        drop(broken);
        wait_for(&server.operator, broken_id, |phase| phase.is_none()).await;

        wait_for(&server.operator, good_id, |phase| {
            phase == Some(Phase::Complete)
        })
        .await;
        server.operator.respond(good_id, "welcome").await.unwrap();
        assert_eq!(submitter.await.unwrap().unwrap(), "welcome");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_waiting_submitters() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let config = server.client_config();
        let submitter = tokio::spawn(async move {
            let mut session = SubmitterSession::new(config);
            session.connect().await.unwrap();
            let response = session.submit(&jane()).await;
            (response, session.state())
        });
        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        wait_for(&server.operator, id, |phase| phase == Some(Phase::Complete))
            .await;

        let operator = server.operator.clone();
        server.stop().await;
        assert!(operator.is_shutting_down());
        assert!(operator.list().is_empty());

        let (response, state) = submitter.await.unwrap();
        assert!(matches!(response, Err(RegError::ConnectionError(_))));
        assert_eq!(state, SubmitterState::Closed);
    }

    #[tokio::test]
    async fn test_immediate_policy_serves_concurrent_submitters() {
        let server = start(AcceptPolicy::Immediate).await;

        let mut submitters = Vec::new();
        for n in 0..3 {
            let config = server.client_config();
            submitters.push(tokio::spawn(async move {
                let bundle = Bundle::new(
                    vec![n as u8; 2048 + n],
                    format!("scan-{n}.png"),
                    SubmitterInfo::new(format!("User {n}"), "Org", "555"),
                );
                regmaster::client::submit(config, &bundle).await
            }));
        }

        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let complete = server
                    .operator
                    .list()
                    .iter()
                    .filter(|s| s.phase == Phase::Complete)
                    .count();
                if complete == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("not every submission completed");

        for session in server.operator.list() {
            let name = session.submitter.unwrap().full_name;
            server.operator.respond(session.id, &name).await.unwrap();
        }
        let mut answers = Vec::new();
        for submitter in submitters {
            answers.push(submitter.await.unwrap().unwrap());
        }
        answers.sort();
        assert_eq!(answers, vec!["User 0", "User 1", "User 2"]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_vanished_peer_is_removed_after_complete() {
        let server = start(AcceptPolicy::AwaitRegistration).await;
        let recorder = Arc::new(Recorder::default());
        server.operator.subscribe(recorder.clone());

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.write_all(&upload(&jane())).await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        wait_for(&server.operator, id, |phase| phase == Some(Phase::Complete))
            .await;

        drop(stream);
        wait_for(&server.operator, id, |phase| phase.is_none()).await;

        assert!(matches!(
            server.operator.respond(id, "creds").await,
            Err(RegError::SessionNotFound(_))
        ));
        let events = recorder.events.lock().unwrap().clone();
        assert!(events
            .iter()
            .any(|e| *e == ServerEvent::Disconnected { id }));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_submitter_withdraws_while_waiting() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let config = server.client_config();
        let (withdraw_tx, withdraw_rx) = tokio::sync::oneshot::channel::<()>();
        let submitter = tokio::spawn(async move {
            let mut session = SubmitterSession::new(config);
            session.connect().await.unwrap();
            let answer = session
                .submit_until(&jane(), async {
                    let _ = withdraw_rx.await;
                })
                .await;
            (answer, session.state())
        });

        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        wait_for(&server.operator, id, |phase| phase == Some(Phase::Complete))
            .await;

        withdraw_tx.send(()).unwrap();
        let (answer, state) = submitter.await.unwrap();
        assert_eq!(answer.unwrap(), None);
        assert_eq!(state, SubmitterState::Closed);

        wait_for(&server.operator, id, |phase| phase.is_none()).await;
        assert!(matches!(
            server.operator.respond(id, "creds").await,
            Err(RegError::SessionNotFound(_))
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_response_leaves_partial_upload_untouched() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let partial = upload(&jane());
        let header_len = partial.len() - encode(&jane()).unwrap().len();
        let split = header_len + 2000;

        let mut slow = TcpStream::connect(server.addr).await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let slow_id = server.operator.list()[0].id;
        slow.write_all(&partial[..split]).await.unwrap();

        let config = server.client_config();
        let fast = tokio::spawn(async move {
            regmaster::client::submit(config, &jane()).await
        });
        wait_for_sessions(&server.operator, 2).await;
        let fast_id = server
            .operator
            .list()
            .iter()
            .map(|s| s.id)
            .find(|id| *id != slow_id)
            .unwrap();

        tokio::time::timeout(WAIT_LIMIT, async {
            while server.operator.get(slow_id).unwrap().received_size < 2000 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("partial upload never arrived");
        wait_for(&server.operator, fast_id, |phase| {
            phase == Some(Phase::Complete)
        })
        .await;

        let before = server.operator.get(slow_id).unwrap();
        server.operator.respond(fast_id, "welcome").await.unwrap();
        assert_eq!(fast.await.unwrap().unwrap(), "welcome");

        let after = server.operator.get(slow_id).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.phase, Phase::Receiving);
        assert_eq!(after.received_size, 2000);

        slow.write_all(&partial[split..]).await.unwrap();
        wait_for(&server.operator, slow_id, |phase| {
            phase == Some(Phase::Complete)
        })
        .await;
        server.operator.respond(slow_id, "also welcome").await.unwrap();
        let mut answer = String::new();
        slow.read_to_string(&mut answer).await.unwrap();
        assert_eq!(answer, "also welcome");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_empty_announcement_fails_the_session() {
        let server = start(AcceptPolicy::AwaitRegistration).await;
        let recorder = Arc::new(Recorder::default());
        server.operator.subscribe(recorder.clone());

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        wait_for_sessions(&server.operator, 1).await;
        let id = server.operator.list()[0].id;
        stream.write_all(b"0").await.unwrap();
        stream.shutdown().await.unwrap();

        wait_for(&server.operator, id, |phase| phase.is_none()).await;
        let events = recorder.events.lock().unwrap().clone();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::Failed { id: failed, error }
                if *failed == id && error.contains("empty bundle")
        )));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_reaches_sessions_before_announcement() {
        let server = start(AcceptPolicy::AwaitRegistration).await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        wait_for_sessions(&server.operator, 1).await;

        server.stop().await;
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, DISCONNECT_SENTINEL.as_bytes());
    }
}
