//! Pipeline assembly happens once per connection, plus once more after an
//! h2c switch, never per request.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use http_transport::config::TransportConfig;

mod common;

use common::{
    find, listener, read_frame, read_more, read_until_close, start_transport, upgrade_to_h2c,
    TestHandler, FRAME_HEADERS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Assembly {
    peer_addr: String,
    protocol: String,
    phase: String,
}

#[derive(Default)]
struct AssemblyFields {
    message: Option<String>,
    peer_addr: Option<String>,
    protocol: Option<String>,
    phase: Option<String>,
}

impl Visit for AssemblyFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "protocol" => self.protocol = Some(value.to_string()),
            "phase" => self.phase = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{:?}", value)),
            "peer_addr" => self.peer_addr = Some(format!("{:?}", value)),
            _ => {}
        }
    }
}

/// Layer collecting every "Pipeline assembled" event.
#[derive(Clone, Default)]
struct Assemblies(Arc<Mutex<Vec<Assembly>>>);

impl Assemblies {
    fn for_peer(&self, peer: &str) -> Vec<Assembly> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.peer_addr == peer)
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for Assemblies {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = AssemblyFields::default();
        event.record(&mut fields);
        if fields.message.as_deref() != Some("Pipeline assembled") {
            return;
        }
        self.0.lock().unwrap().push(Assembly {
            peer_addr: fields.peer_addr.unwrap_or_default(),
            protocol: fields.protocol.unwrap_or_default(),
            phase: fields.phase.unwrap_or_default(),
        });
    }
}

fn config_for(port: u16) -> TransportConfig {
    TransportConfig {
        listeners: vec![listener(port)],
        ..Default::default()
    }
}

// Current-thread runtime: the scoped subscriber sees every connection task.
#[tokio::test]
async fn test_one_assembly_per_connection() {
    let assemblies = Assemblies::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(assemblies.clone()));

    let handler = Arc::new(TestHandler::default());
    let shutdown = start_transport(config_for(18501), handler).await;

    // Three keep-alive requests on one connection.
    let mut stream = TcpStream::connect("127.0.0.1:18501").await.unwrap();
    let peer = stream.local_addr().unwrap().to_string();
    let mut buf = Vec::new();
    for path in ["/a", "/b"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: h\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        while find(&buf, b"\r\n\r\nok").is_none() {
            read_more(&mut stream, &mut buf).await;
        }
        buf.clear();
    }
    stream
        .write_all(b"GET /c HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let last = read_until_close(&mut stream).await;
    assert!(last.starts_with(b"HTTP/1.1 200"));

    assert_eq!(
        assemblies.for_peer(&peer),
        vec![Assembly {
            peer_addr: peer.clone(),
            protocol: "http/1.1".into(),
            phase: "initial".into(),
        }]
    );

    shutdown.trigger();
}

#[tokio::test]
async fn test_h2c_switch_assembles_exactly_once_more() {
    let assemblies = Assemblies::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(assemblies.clone()));

    let handler = Arc::new(TestHandler::default());
    let shutdown = start_transport(config_for(18502), handler).await;

    let mut stream = TcpStream::connect("127.0.0.1:18502").await.unwrap();
    let peer = stream.local_addr().unwrap().to_string();
    let mut buf = upgrade_to_h2c(&mut stream, "/x").await;
    loop {
        let frame = read_frame(&mut stream, &mut buf).await;
        if frame.kind == FRAME_HEADERS && frame.stream_id == 1 {
            break;
        }
    }

    let phases: Vec<(String, String)> = assemblies
        .for_peer(&peer)
        .into_iter()
        .map(|a| (a.protocol, a.phase))
        .collect();
    assert_eq!(
        phases,
        vec![
            ("http/1.1".to_string(), "initial".to_string()),
            ("h2c".to_string(), "upgrade".to_string()),
        ]
    );

    shutdown.trigger();
}
