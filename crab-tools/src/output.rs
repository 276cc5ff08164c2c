use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;

/// Prints one JSON document per row, so output can be piped into `jq`.
pub fn print_rows<T: Serialize>(rows: &[T]) -> Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(render_rows(rows)?.as_bytes())
        .context("while writing to stdout")
}

pub fn print_one<T: Serialize>(row: &T) -> Result<()> {
    print_rows(std::slice::from_ref(row))
}

fn render_rows<T: Serialize>(rows: &[T]) -> Result<String> {
    let mut rendered = String::new();
    for row in rows {
        rendered.push_str(&serde_json::to_string(row).context("during serialisation of a row")?);
        rendered.push('\n');
    }
    Ok(rendered)
}
