use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conflux_server::config::ServerConfig;
use conflux_server::hooks::ServerHooks;
use conflux_server::{DefaultHooks, Server, ServerHandle};
use conflux_wire::types::PROTOCOL_REVISION;
use conflux_wire::{ClientId, Message, RelayCodec};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ws_listen: None,
        wss_listen: None,
        tls_cert: "./fullchain.pem".into(),
        tls_key: "./privkey.pem".into(),
        welcome: "welcome to the test relay".into(),
        upload_cap: None,
        max_conns: 1000,
        max_conns_ip: 100,
        handshake_timeout: 5,
        ping_interval: 30,
        pong_timeout: 60,
        name_codepoints: "L*,M*,N*,P*,32".into(),
        channel_codepoints: "L*,M*,N*,P*,32".into(),
        server_message_codepoints: "L*,M*,N*,P*,32".into(),
        client_message_codepoints: None,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub ws_addr: Option<SocketAddr>,
    pub handle: ServerHandle,
}

pub async fn start_server() -> TestServer {
    start_server_with(test_config(), Arc::new(DefaultHooks)).await
}

pub async fn start_server_with(config: ServerConfig, hooks: Arc<dyn ServerHooks>) -> TestServer {
    let server = Server::bind(config, hooks).await.unwrap();
    let test_server = TestServer {
        addr: server.local_addr(),
        udp_addr: server.udp_local_addr(),
        ws_addr: server.ws_local_addr(),
        handle: server.handle(),
    };
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("server error in test: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    test_server
}

pub struct TestClient {
    pub framed: Framed<TcpStream, RelayCodec>,
    pub id: ClientId,
    pub welcome: String,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr, name: &str) -> Self {
        let mut framed = Self::open(addr, name).await;
        match next_record(&mut framed).await.expect("stream open") {
            Message::Welcome { id, welcome } => Self {
                framed,
                id,
                welcome,
            },
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    pub async fn connect_expect_deny(addr: &SocketAddr, name: &str) -> String {
        let mut framed = Self::open(addr, name).await;
        match next_record(&mut framed).await.expect("stream open") {
            Message::ConnectDeny { reason } => reason,
            other => panic!("expected ConnectDeny, got {other:?}"),
        }
    }

    async fn open(addr: &SocketAddr, name: &str) -> Framed<TcpStream, RelayCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, RelayCodec::client());
        framed
            .send(Message::Handshake {
                revision: PROTOCOL_REVISION,
                name: name.to_owned(),
            })
            .await
            .unwrap();
        framed
    }

    pub async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.unwrap();
    }

    pub async fn join(&mut self, channel: &str, flags: u8) -> Message {
        self.send(Message::JoinChannel {
            flags,
            name: channel.to_owned(),
        })
        .await;
        loop {
            let msg = self.recv().await;
            if matches!(msg, Message::JoinResponse { .. }) {
                return msg;
            }
        }
    }

    /// Next record, answering server pings along the way.
    pub async fn recv(&mut self) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), next_record(&mut self.framed))
                .await
                .expect("timeout waiting for record")
                .expect("stream closed");
            match msg {
                Message::Ping => self.send(Message::Pong).await,
                other => return other,
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Waits for the server to close the stream; panics on more data.
    pub async fn expect_close(mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("server did not close the stream in time");
            match tokio::time::timeout(remaining, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(_))) => {}
                Err(_) => panic!("server did not close the stream in time"),
            }
        }
    }
}

async fn next_record(framed: &mut Framed<TcpStream, RelayCodec>) -> Option<Message> {
    match framed.next().await {
        Some(Ok(msg)) => Some(msg),
        Some(Err(_)) | None => None,
    }
}
