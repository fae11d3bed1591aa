//! Remote echo - one command, executed in-process and over TCP.
//!
//! This example demonstrates:
//! - Registering a handler on a [`Server`] and serving it on a TCP port
//! - Binding the same command to a remote [`Channel`] on the caller side
//! - Validation errors crossing the process boundary unchanged
//!
//! ```text
//! RUST_LOG=procwire_dispatch=debug cargo run --example remote_echo
//! ```

use std::sync::Arc;

use procwire_dispatch::transport::Listener;
use procwire_dispatch::{
    ChannelOptions, ChannelPool, Command, DispatchError, Dispatcher, ExecutionContext, Registry,
    Server,
};
use serde::{Deserialize, Serialize};

/// Input for the echo command.
#[derive(Serialize, Deserialize, Debug)]
struct Echo {
    message: String,
}

impl Command for Echo {
    const NAME: &'static str = "demo.echo";
    type Output = String;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Handler side
    let server = Server::builder()
        .handle_fn::<Echo, _, _>(|cmd, ctx| async move {
            if cmd.message.trim().is_empty() {
                ctx.add_field_error("message", "must not be blank");
            }
            Ok(cmd.message)
        })
        .build()?;
    let listener = Listener::bind("127.0.0.1:0").await?;
    let address = listener.local_address();
    let serving = server.spawn(listener);
    println!("handler server on {address}");

    // Caller side
    let pool = ChannelPool::new();
    let registry = Arc::new(Registry::new());
    registry.register_remote::<Echo>(&pool.get_or_open(&address, ChannelOptions::default()))?;
    let dispatcher = Dispatcher::new(registry);

    let reply = dispatcher
        .execute(Echo {
            message: "hello over the wire".into(),
        })
        .await?;
    println!("reply: {reply}");

    let ctx = ExecutionContext::new();
    match dispatcher
        .execute_with(Echo { message: "  ".into() }, &ctx)
        .await
    {
        Err(DispatchError::ValidationFailed(errors)) => println!("rejected: {errors}"),
        other => println!("unexpected: {other:?}"),
    }

    pool.close_all().await;
    server.shutdown();
    serving.await??;
    Ok(())
}
