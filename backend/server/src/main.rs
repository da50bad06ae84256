#[tokio::main]
async fn main() {
    crowdfund::start_server().await;
}
