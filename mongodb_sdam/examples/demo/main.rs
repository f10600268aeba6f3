use std::time::Duration;

use async_trait::async_trait;
use mongodb_sdam::{
    command_name, CommandOptions, ConnectOptions, Connection, Connector, Document, Namespace,
    ReadPreference, SdamError, SdamEvent, ServerAddress, TopologyBuilder,
};
use serde_json::{json, Value};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

const HOSTS: [&str; 3] = ["node-a:27017", "node-b:27017", "node-c:27017"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let topology = TopologyBuilder::new()
        .set_hosts(&HOSTS[..1])
        .set_replica_set("demo")
        .set_heartbeat_frequency(Duration::from_millis(500))
        .set_connector(InMemoryReplicaSet)
        .build()?;

    let mut events = topology.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SdamEvent::ServerHeartbeatStarted(_) | SdamEvent::ServerHeartbeatSucceeded(_) => {}
                other => tracing::info!("{:?}", other),
            }
        }
    });

    topology.connect().await?;

    let people = Namespace::new("demo", "people");
    let ada = json!({"name": "Ada"}).as_object().cloned().unwrap_or_default();
    let reply = topology
        .insert(&people, vec![ada], CommandOptions::default(), None)
        .await?;
    println!("insert: {}", Value::Object(reply));

    let options = CommandOptions {
        read_preference: Some(ReadPreference::secondary_preferred()),
        ..Default::default()
    };
    let mut cursor = topology
        .cursor(people, Document::new(), None, options)
        .await?;
    println!("find ran on {}", cursor.server_address());
    while let Some(document) = cursor.next().await? {
        println!("{}", Value::Object(document));
    }

    println!("{:#?}", topology.description());
    topology.close().await?;
    Ok(())
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let formatting_layer = BunyanFormattingLayer::new("mongodb-sdam-demo".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Failed to set subscriber");
}

/// Three nodes that always agree node-a is primary.
#[derive(Clone, Debug)]
struct InMemoryReplicaSet;

#[async_trait]
impl Connector for InMemoryReplicaSet {
    async fn connect(
        &self,
        address: &ServerAddress,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, SdamError> {
        Ok(Box::new(InMemoryConnection {
            is_primary: address.to_string() == HOSTS[0],
        }))
    }
}

#[derive(Debug)]
struct InMemoryConnection {
    is_primary: bool,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn command(&mut self, _db: &str, command: Document) -> Result<Document, SdamError> {
        let reply = match command_name(&command) {
            Some("hello") | Some("isMaster") => json!({
                "ok": 1, "helloOk": true, "setName": "demo", "hosts": HOSTS, "setVersion": 1,
                "isWritablePrimary": self.is_primary, "secondary": !self.is_primary,
                "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
            }),
            Some("find") => json!({
                "ok": 1,
                "cursor": {"id": 0, "ns": "demo.people", "firstBatch": [{"name": "Ada"}]}
            }),
            Some("insert") => json!({"ok": 1, "n": 1}),
            _ => json!({"ok": 1}),
        };
        reply
            .as_object()
            .cloned()
            .ok_or_else(|| SdamError::InvalidReply("reply is not a document".to_string()))
    }

    async fn destroy(&mut self, _force: bool) {}
}
