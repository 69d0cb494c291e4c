//! Record commands: raw queries and logged CRUD

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use duosync_core::{
    delete_record, get_change_log, get_record, insert_record, update_record, DatabaseManager,
    OperationContext, Record, Value,
};

#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// SQL with `?` placeholders
    pub sql: String,

    /// Placeholder value, in order (JSON when it parses, text otherwise)
    #[arg(long = "param", value_name = "VALUE")]
    pub params: Vec<String>,

    /// Treat the statement as a write and mirror it to the cloud
    #[arg(long)]
    pub write: bool,

    /// Never touch the cloud
    #[arg(long)]
    pub local_only: bool,

    /// Print rows as a JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InsertArgs {
    pub table: String,

    /// Column assignment; repeat for each column
    #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
    pub set: Vec<String>,

    #[command(flatten)]
    pub write: WriteOptions,
}

#[derive(Parser, Debug)]
pub struct UpdateArgs {
    pub table: String,
    pub id: String,

    /// Column assignment; repeat for each column
    #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
    pub set: Vec<String>,

    #[command(flatten)]
    pub write: WriteOptions,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    pub table: String,
    pub id: String,

    #[command(flatten)]
    pub write: WriteOptions,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    pub table: String,
    pub id: String,
}

#[derive(Parser, Debug)]
pub struct WriteOptions {
    /// Skip the cloud mirror; `duosync sync` pushes the change later
    #[arg(long)]
    pub local_only: bool,

    /// User recorded in the change log
    #[arg(long, env = "DUOSYNC_USER")]
    pub user: Option<String>,
}

impl WriteOptions {
    fn context(&self) -> OperationContext {
        let mut ctx = OperationContext::new();
        if let Some(user) = &self.user {
            ctx = ctx.with_user(user.as_str());
        }
        if self.local_only {
            ctx = ctx.local_only();
        }
        ctx
    }
}

/// Parse `key=value` pairs into a record
fn parse_assignments(pairs: &[String]) -> Result<Record> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("empty column name in '{}'", pair));
            }
            Ok((key.to_string(), Value::parse_loose(value)))
        })
        .collect()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_query(db: &DatabaseManager, args: QueryArgs) -> Result<()> {
    let params: Vec<Value> = args.params.iter().map(|p| Value::parse_loose(p)).collect();
    let rows = db
        .execute_query(&args.sql, &params, args.write, args.local_only)
        .await
        .context("query failed")?;

    if args.json {
        let records: Vec<Record> = rows.into_iter().map(|row| row.into_record()).collect();
        return print_json(&records);
    }

    if let Some(first) = rows.first() {
        println!("{}", first.columns().join("\t"));
    }
    for row in &rows {
        let cells: Vec<String> = row.values().iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    eprintln!("({} rows)", rows.len());
    Ok(())
}

pub async fn run_insert(db: &DatabaseManager, args: InsertArgs) -> Result<()> {
    let data = parse_assignments(&args.set)?;
    let id = insert_record(db, &args.write.context(), &args.table, data)
        .await
        .with_context(|| format!("failed to insert into {}", args.table))?;
    println!("{}", id);
    Ok(())
}

pub async fn run_get(db: &DatabaseManager, args: GetArgs) -> Result<()> {
    let record = get_record(db, &args.table, &args.id)
        .await
        .with_context(|| format!("failed to read {} {}", args.table, args.id))?
        .ok_or_else(|| anyhow!("{} {} not found", args.table, args.id))?;
    print_json(&record)
}

pub async fn run_update(db: &DatabaseManager, args: UpdateArgs) -> Result<()> {
    let data = parse_assignments(&args.set)?;
    update_record(db, &args.write.context(), &args.table, &args.id, data)
        .await
        .with_context(|| format!("failed to update {} {}", args.table, args.id))?;
    println!("updated {} {}", args.table, args.id);
    Ok(())
}

pub async fn run_delete(db: &DatabaseManager, args: DeleteArgs) -> Result<()> {
    delete_record(db, &args.write.context(), &args.table, &args.id)
        .await
        .with_context(|| format!("failed to delete {} {}", args.table, args.id))?;
    println!("deleted {} {}", args.table, args.id);
    Ok(())
}

pub async fn run_history(db: &DatabaseManager, args: GetArgs) -> Result<()> {
    let entries = get_change_log(db, &args.table, &args.id)
        .await
        .with_context(|| format!("failed to read history of {} {}", args.table, args.id))?;
    print_json(&entries)
}
