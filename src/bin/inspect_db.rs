use chrono::{DateTime, Local, TimeZone};
use mailpulse::config::{Config, SETTINGS_FILE};
use mailpulse::db::Database;
use std::env;

fn local_time(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) if millis > 0 => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "-".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <mailbox address> [max rows]", args[0]);
        eprintln!("Prints the change ledger and label samples recorded for a mailbox.");
        std::process::exit(1);
    }
    let identity = &args[1];
    let limit: usize = args.get(2).and_then(|n| n.parse().ok()).unwrap_or(50);

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Ignoring {}: {}", SETTINGS_FILE, e);
        Config::default()
    });
    let db = Database::new(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let Some(account) = db.find_account_by_identity(identity).await? else {
        println!("No account recorded for {}", identity);
        return Ok(());
    };
    let created: DateTime<Local> = Local
        .timestamp_millis_opt(account.created_at)
        .single()
        .unwrap_or_else(Local::now);
    println!("Account {} ({}) since {}", account.id, account.identity, created.format("%Y-%m-%d"));

    let events = db.history_events_for_account(account.id).await?;
    println!("\n{} history events (newest {} shown)", events.len(), limit.min(events.len()));
    println!("{:>12}  {:<19}  {:<12}  {:>4} {:>4} {:>4} {:>4}", "history", "occurred", "status", "+msg", "-msg", "+unr", "-unr");
    for event in events.iter().rev().take(limit) {
        println!(
            "{:>12}  {:<19}  {:<12}  {:>4} {:>4} {:>4} {:>4}{}",
            event.history_id,
            local_time(event.date_occurred),
            event.status,
            event.counts.messages_added,
            event.counts.messages_removed,
            event.counts.unread_added,
            event.counts.unread_removed,
            if event.is_placeholder() { "  (notified only)" } else { "" }
        );
    }

    let samples = db.label_summaries_since(account.id, 0).await?;
    println!("\n{} label samples (newest {} shown)", samples.len(), limit.min(samples.len()));
    for sample in samples.iter().rev().take(limit) {
        println!(
            "{:<19}  {:<8} total {:>6}  unread {:>5}  history {}",
            local_time(sample.sampled_at),
            sample.label_name,
            sample.messages_total,
            sample.messages_unread,
            sample.last_history_id
        );
    }

    println!("\n{} cached messages", db.count_messages(account.id).await?);
    Ok(())
}
