#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orchestrator::init_tracing();
    orchestrator::run().await
}
