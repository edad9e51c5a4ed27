//! Khala - shared-memory messaging between a VM guest and its host.
//!
//! Usage: `khala host` or `khala guest`. Everything else comes from the
//! configuration file and `KHALA_*` environment variables.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use khala::config::{Role, TransportConfig};
use khala::session::{self, StaticResponse};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "khala=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let role: Role = std::env::args()
        .nth(1)
        .context("Usage: khala <host|guest>")?
        .parse()?;

    tracing::info!("Starting khala {} v{}", role, env!("CARGO_PKG_VERSION"));
    let config = TransportConfig::load(role).context("Failed to load configuration")?;

    let result = match role {
        Role::Host => {
            let responder = StaticResponse::new(config.session.response.clone());
            session::serve(&config, responder, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
        }
        Role::Guest => session::run_guest(&config).await.map(|replies| {
            let missing = replies.iter().filter(|reply| reply.is_none()).count();
            tracing::info!(
                "Guest finished: {} replies, {} missing",
                replies.len() - missing,
                missing
            );
        }),
    };

    if let Err(e) = result {
        tracing::error!("Application error: {:#}", e);
        return Err(e);
    }

    tracing::info!("khala {} exited cleanly", role);
    Ok(())
}
