#[tokio::main]
async fn main() -> eyre::Result<()> {
    mailspool::run().await
}
