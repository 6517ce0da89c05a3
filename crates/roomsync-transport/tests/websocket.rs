//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and connect to it
//! with the client-side connector, so both halves of the transport are
//! exercised over a real socket.

#[cfg(feature = "websocket")]
mod websocket {
    use std::sync::Arc;
    use std::time::Duration;

    use roomsync_transport::{
        outbound_queue, Connection, Transport, WebSocketConnection,
        WebSocketTransport,
    };

    async fn pair() -> (WebSocketConnection, WebSocketConnection) {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let client = WebSocketConnection::connect(&format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let server_conn = server.await.expect("task should complete");
        (server_conn, client)
    }

    #[tokio::test]
    async fn test_websocket_send_receive_both_directions() {
        let (server, client) = pair().await;
        assert!(server.is_open());
        assert!(client.is_open());
        assert_ne!(server.id(), client.id());

        server.send(b"hello from server").await.expect("send");
        let got = client.recv().await.expect("recv").expect("frame");
        assert_eq!(got, b"hello from server");

        client.send(b"hello from client").await.expect("send");
        let got = server.recv().await.expect("recv").expect("frame");
        assert_eq!(got, b"hello from client");
    }

    #[tokio::test]
    async fn test_websocket_close_is_observed_by_peer() {
        let (server, client) = pair().await;

        client.close().await.expect("close");
        assert!(!client.is_open());

        let result = tokio::time::timeout(Duration::from_secs(2), server.recv())
            .await
            .expect("recv should not hang");
        assert!(matches!(result, Ok(None)));
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn test_writer_task_drains_queue_in_order() {
        let (server, client) = pair().await;
        let server = Arc::new(server);
        let (tx, rx) = outbound_queue();
        let writer = server.spawn_writer(rx);

        tx.send(b"one".to_vec()).unwrap();
        tx.send(b"two".to_vec()).unwrap();

        assert_eq!(client.recv().await.unwrap().unwrap(), b"one");
        assert_eq!(client.recv().await.unwrap().unwrap(), b"two");

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer should stop once the queue closes")
            .expect("writer task should not panic");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().unwrap();
        drop(transport);

        let result = WebSocketConnection::connect(&format!("ws://{addr}")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stalled_upgrade_does_not_block_next_accept() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().unwrap();

        // Opens TCP but never sends the HTTP upgrade.
        let _stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
        let stalled = transport.accept_tcp().await.expect("tcp accept");
        let stalled_upgrade = tokio::spawn(stalled.upgrade());

        let server = tokio::spawn(async move {
            let pending = transport.accept_tcp().await.expect("tcp accept");
            pending.upgrade().await.expect("upgrade")
        });
        let client = WebSocketConnection::connect(&format!("ws://{addr}"))
            .await
            .expect("second client should connect");
        let server_conn = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("second upgrade should not wait on the first")
            .unwrap();

        client.send(b"ok").await.unwrap();
        assert_eq!(server_conn.recv().await.unwrap().unwrap(), b"ok");
        assert!(!stalled_upgrade.is_finished());
        stalled_upgrade.abort();
    }
}
