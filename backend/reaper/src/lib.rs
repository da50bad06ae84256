//! # Reaper
//!
//! One-shot cleanup of abandoned checkouts.
//!
//! The server already reaps on a timer. This binary exists for operators: run it after an
//! outage, or with a shorter window than the server's TTL.
//!
//! ## Steps
//! 1. Connect to the same Redis the server uses.
//! 2. Collect every pending order older than the window.
//! 3. Fail them one by one. Orders settled in the meantime are skipped.
//! 4. Optionally print the reconciliation queue.
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use crowdfund::{
    database::{RedisRecords, init_redis},
    reaper::reap_order,
    records::ContributionStore,
};
use indicatif::{ProgressBar, ProgressStyle};

pub async fn run(redis_url: &str, older_than_mins: i64, list_unreconciled: bool) -> Result<()> {
    let before = cutoff(Utc::now(), older_than_mins)?;

    let connection = init_redis(redis_url)
        .await
        .with_context(|| format!("Connecting to {redis_url}"))?;
    let records = RedisRecords::new(connection);

    let orphans = records.pending_before(before).await?;

    println!("Pending before {before}: {}\n", orphans.len());

    let reaped = reap(&records, &orphans).await?;

    println!("Reaped: {reaped}");
    println!("Settled meanwhile: {}", orphans.len() - reaped);

    if list_unreconciled {
        let queue = records.unreconciled().await?;

        println!("\nAwaiting reconciliation: {}", queue.len());
        for order_id in queue {
            println!("  {order_id}");
        }
    }

    Ok(())
}

fn cutoff(now: DateTime<Utc>, older_than_mins: i64) -> Result<DateTime<Utc>> {
    if older_than_mins < 0 {
        bail!("Window must not be negative, got {older_than_mins} minutes");
    }

    Duration::try_minutes(older_than_mins)
        .and_then(|window| now.checked_sub_signed(window))
        .with_context(|| format!("Window of {older_than_mins} minutes is out of range"))
}

async fn reap(records: &dyn ContributionStore, orphans: &[String]) -> Result<usize> {
    let pb = ProgressBar::new(orphans.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=> "),
    );

    let mut reaped = 0;

    for order_id in orphans {
        pb.set_message(order_id.clone());

        if reap_order(records, order_id).await? {
            reaped += 1;
        }

        pb.inc(1);
    }

    pb.finish_with_message("Done");

    Ok(reaped)
}
