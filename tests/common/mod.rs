//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use dmq_node::dmq::{status, CompletionContext, InboundHandler, OutboundRequest, Transport};
use dmq_node::{Dmq, DmqConfig, Error};

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Get the valid config fixture path
pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

/// Get the invalid config fixture path
pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// Config file inside a private temp directory
pub struct ConfigFixture {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("node.toml");
        Self { temp_dir, config_path }
    }

    pub fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    pub fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    pub fn dir(&self) -> &TempDir {
        &self.temp_dir
    }
}

// ─────────────────────────────────────────────────────────────────
// Loopback Mesh
// ─────────────────────────────────────────────────────────────────

/// Routes requests between instances by node address
#[derive(Default)]
pub struct Mesh {
    members: Mutex<HashMap<String, Weak<Dmq>>>,
    pub delivered: AtomicUsize,
}

impl Mesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, dmq: &Arc<Dmq>) {
        self.members
            .lock()
            .insert(dmq.local_address().to_string(), Arc::downgrade(dmq));
    }

    pub fn lookup(&self, address: &str) -> Option<Arc<Dmq>> {
        self.members.lock().get(address).and_then(Weak::upgrade)
    }
}

impl Transport for Mesh {
    fn deliver(&self, request: OutboundRequest, ctx: CompletionContext) -> dmq_node::Result<()> {
        self.delivered.fetch_add(1, Ordering::SeqCst);

        let Some(target) = self.lookup(&ctx.node().address) else {
            ctx.complete(status::SERVICE_UNAVAILABLE);
            return Ok(());
        };

        let (message, reply) = request.into_inbound().with_reply();
        if let Err(e) = target.on_inbound(message) {
            let code = match e {
                Error::PeerNotFound { .. } => status::NOT_FOUND,
                _ => status::SERVER_ERROR,
            };
            ctx.complete(code);
            return Ok(());
        }

        tokio::spawn(async move {
            let code = match reply.await {
                Ok(response) => response.code,
                Err(_) => status::SERVER_ERROR,
            };
            ctx.complete(code);
        });
        Ok(())
    }
}

pub fn node_config(address: &str) -> DmqConfig {
    let mut config = DmqConfig::new(address).with_workers(2);
    // Keep the timer out of the way; tests drive gossip by hand
    config.ping_interval = Duration::from_secs(3600);
    config
}

pub fn spawn_node(mesh: &Arc<Mesh>, config: DmqConfig) -> Arc<Dmq> {
    let transport: Arc<dyn Transport> = mesh.clone();
    let dmq = Dmq::new(config, transport).unwrap();
    mesh.join(&dmq);
    dmq
}

/// Poll `cond` until it holds or two seconds pass
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
