//! `bansho serve` — stand up the gateway and speak MCP on stdio.

use std::sync::Arc;

use tracing::info;

use bansho_proxy::{open_transport, Gateway, Upstream, UpstreamTarget};
use bansho_security::audit::PostgresAuditSink;
use bansho_security::keys::PostgresCredentialStore;
use bansho_security::ratelimit::RedisCounterStore;
use bansho_types::policy::load_policy;
use bansho_types::{CounterStore, Settings, UpstreamTransportKind};

pub async fn run(settings: Settings, print_settings: bool) -> anyhow::Result<()> {
    if print_settings {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    // Everything that can fail at startup fails here, before the first
    // downstream frame is read.
    let policy = load_policy(&settings.policy_path)?;
    let pool = crate::db::connect_and_migrate(&settings).await?;
    crate::db::ping(&pool).await?;

    let counter_store = RedisCounterStore::connect(&settings.redis_url).await?;
    counter_store.ping().await?;

    let target = UpstreamTarget::from_settings(&settings)?;
    let transport = open_transport(&target)?;
    let upstream = Arc::new(Upstream::new(transport));

    let gateway = Gateway::new(
        policy,
        Arc::new(PostgresCredentialStore::new(pool.clone())),
        Arc::new(counter_store),
        Arc::new(PostgresAuditSink::new(pool)),
        Arc::clone(&upstream),
    )
    .await?;

    let listen_addr = format!("{}:{}", settings.listen_host, settings.listen_port);
    info!(
        listen_addr = %listen_addr,
        upstream_transport = ?settings.upstream_transport,
        upstream_target = %upstream_target_label(&settings),
        policy_path = %settings.policy_path.display(),
        "bansho_proxy_start"
    );

    Arc::new(gateway).serve_stdio().await?;
    upstream.shutdown().await;
    Ok(())
}

fn upstream_target_label(settings: &Settings) -> &str {
    match settings.upstream_transport {
        UpstreamTransportKind::Stdio => &settings.upstream_cmd,
        UpstreamTransportKind::Http => &settings.upstream_url,
    }
}
