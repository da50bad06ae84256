use std::env;

use clap::Parser;
use gateway::{Amount, SignatureVerifier};
use serde_json::json;

/// Prints the body a checkout page would post to `/contributions/confirm` once the gateway
/// captured `payment_id` against `order_id`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    order_id: String,

    payment_id: String,

    amount: f64,

    /// Overrides GATEWAY_KEY_SECRET.
    #[arg(long)]
    secret: Option<String>,
}

fn main() {
    let args = Args::parse();

    let secret = args
        .secret
        .or_else(|| env::var("GATEWAY_KEY_SECRET").ok())
        .expect("Pass --secret or set GATEWAY_KEY_SECRET");

    let amount = Amount::from_major(args.amount).expect("Amount must be positive");
    println!("Signing {amount} for {}", args.order_id);
    let signature = SignatureVerifier::new(secret.as_bytes()).sign(&args.order_id, &args.payment_id);

    let body = json!({
        "orderId": args.order_id,
        "paymentId": args.payment_id,
        "signature": signature,
        "amount": args.amount,
    });

    println!("{body:#}");
}
