use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Fail pending contributions older than this many minutes.
    #[arg(long, default_value_t = 30)]
    older_than_mins: i64,

    /// Also print the order ids waiting for manual reconciliation.
    #[arg(long)]
    list_unreconciled: bool,

    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    reaper::run(&args.redis_url, args.older_than_mins, args.list_unreconciled).await
}
