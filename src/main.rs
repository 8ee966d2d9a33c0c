#[tokio::main]
async fn main() -> anyhow::Result<()> {
    neuro_notes_lib::run().await
}
