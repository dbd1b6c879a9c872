#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zekai_lib::run().await
}
