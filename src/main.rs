#[tokio::main]
async fn main() -> anyhow::Result<()> {
    copilot_gateway_lib::run().await
}
