//! Human mode prints strings bare and everything else as pretty JSON; JSON
//! mode wraps the result in `{ "data": ... }`.

use anyhow::Result;
use serde_json::{Value, json};

use crate::opts::NodeOpts;

pub fn print_success(opts: &NodeOpts, data: Value) -> Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string(&json!({ "data": data }))?);
        return Ok(());
    }
    match data {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}
