mod dispatcher;
mod host;
mod poller;
mod store;
mod supervisor;
mod transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
