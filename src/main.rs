#[tokio::main]
async fn main() -> anyhow::Result<()> {
    site_map_lib::run().await
}
