//! Streaming calls in both directions over a unix socket (TCP elsewhere).
//!
//! - `Countdown` is server-streaming: one command in, a sequence of items out
//! - `Average` is client-streaming: a sequence of items in, one result out
//!
//! ```text
//! cargo run --example server_stream
//! ```

use std::sync::Arc;

use procwire_dispatch::transport::{generate_socket_path, Listener};
use procwire_dispatch::{
    Channel, ChannelOptions, ChunkStream, ClientStreamCommand, Dispatcher, ExecutionContext,
    Registry, Server, ServerStreamCommand, StreamSink,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Countdown {
    from: u32,
}

impl ServerStreamCommand for Countdown {
    const NAME: &'static str = "demo.countdown";
    type Item = u32;
}

#[derive(Serialize, Deserialize)]
struct Average;

impl ClientStreamCommand for Average {
    const NAME: &'static str = "demo.average";
    type Item = f64;
    type Output = f64;
}

fn address() -> String {
    if cfg!(unix) {
        format!("unix://{}", generate_socket_path().display())
    } else {
        "127.0.0.1:0".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::builder()
        .handle_server_stream_fn::<Countdown, _, _>(
            |cmd, mut sink: StreamSink<u32>, _ctx| async move {
                for n in (0..=cmd.from).rev() {
                    sink.send(n).await?;
                }
                Ok(())
            },
        )
        .handle_client_stream_fn::<Average, _, _>(
            |_, mut samples: ChunkStream<f64>, _ctx| async move {
                let (mut sum, mut count) = (0.0, 0u32);
                while let Some(sample) = samples.next().await {
                    sum += sample?;
                    count += 1;
                }
                Ok(if count == 0 { 0.0 } else { sum / f64::from(count) })
            },
        )
        .build()?;

    let listener = Listener::bind(&address()).await?;
    let channel = Channel::open(listener.local_address(), ChannelOptions::default());
    let serving = server.spawn(listener);

    let registry = Arc::new(Registry::new());
    registry.register_remote_server_stream::<Countdown>(&channel)?;
    registry.register_remote_client_stream::<Average>(&channel)?;
    let dispatcher = Dispatcher::new(registry);

    let ctx = ExecutionContext::new();
    let mut items = dispatcher.stream(Countdown { from: 5 }, &ctx);
    while let Some(item) = items.next().await {
        println!("countdown: {}", item?);
    }

    let mut call = dispatcher.open_client_stream(Average, &ctx).await?;
    for sample in [2.0, 4.0, 9.0] {
        call.send(sample).await?;
    }
    let sent = call.sent();
    println!("sent {sent} samples, average {}", call.finish().await?);

    channel.close().await;
    server.shutdown();
    serving.await??;
    Ok(())
}
