use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use futures_util::StreamExt;
use tokio::select;
use tracing::{error, info, warn, Level};

use livechannel::channel::channel::Channel;
use livechannel::channel::channel_config::ChannelConfig;
use livechannel::endpoint::EndpointDescriptor;
use livechannel::transport::auth::StaticHeaderAuth;
use livechannel::transport::websocket::WebSocketOptions;

/// Subscribes to a streaming endpoint and prints every message it receives
#[derive(Parser)]
struct Args {
    /// e.g. wss://example.com/streams/abc/channel?includeInitialValues=true
    url: String,

    #[clap(long, default_value_t = false)]
    reconnect: bool,

    /// seconds of failed reconnecting before giving up, 0 for no limit
    #[clap(long, default_value_t = 3600)]
    dead_channel_timeout: u64,

    #[clap(long)]
    bearer_token: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let endpoint = EndpointDescriptor::parse(&args.url)?;

    let mut options = WebSocketOptions::default();
    if let Some(token) = &args.bearer_token {
        options.auth = Some(Arc::new(StaticHeaderAuth::bearer(token)?));
    }

    let config = ChannelConfig {
        reconnect: args.reconnect,
        dead_channel_timeout: match args.dead_channel_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        ..ChannelConfig::new()
    };

    let channel = Channel::connect(endpoint, options, config).await?;
    info!(endpoint = %channel.endpoint(), "subscribed - press Ctrl-C to stop");

    let mut messages = channel.messages();
    loop {
        select! {
            msg = messages.next() => match msg {
                Some(Ok(msg)) => println!("{}", msg.content()),
                Some(Err(e)) => {
                    error!("channel failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("closing channel");
                break;
            }
        }
    }

    drop(messages);
    if let Err(e) = channel.close().await {
        warn!("error closing channel: {}", e);
    }
    Ok(())
}
