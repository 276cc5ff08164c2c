use anyhow::{Context, Result};
use clap::Args;
use futures::executor;
use log::info;
use queue_models::ControlEvent;

use score_crab::helpers::rabbit;
use score_crab::helpers::stop::flatten;
use score_crab::transport::{RabbitTransport, Transport};

#[derive(Args, Clone)]
pub struct Params {
    #[clap(flatten)]
    rabbit: rabbit::Params,
}

pub fn handle(params: Params, event: ControlEvent) -> Result<()> {
    let handle = tokio::spawn(async move {
        let transport = RabbitTransport::connect(&params.rabbit, "crab-tools").await?;
        send(&transport, event).await
    });
    executor::block_on(flatten(handle))?;

    info!("Published {} on the events channel.", event);
    Ok(())
}

async fn send(transport: &dyn Transport, event: ControlEvent) -> Result<()> {
    transport
        .publish(event)
        .await
        .with_context(|| format!("while publishing {}", event))
}
