pub mod handle;
pub mod simulate;
pub mod topology;

use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct OutputContext {
    pub json: bool,
    pub verbose: bool,
}

impl OutputContext {
    /// Print `rows` under `columns`, or as JSON objects in JSON mode
    pub fn print_table(&self, columns: &[&str], rows: &[Vec<String>]) -> Result<()> {
        if self.json {
            let objects: Vec<serde_json::Map<String, serde_json::Value>> = rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .zip(row)
                        .map(|(c, v)| (c.to_string(), serde_json::Value::String(v.clone())))
                        .collect()
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&objects)?);
            return Ok(());
        }

        let widths: Vec<usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                rows.iter()
                    .filter_map(|r| r.get(i))
                    .map(String::len)
                    .chain(std::iter::once(c.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        println!("{}", pad_row(columns.iter().copied(), &widths));
        println!("{}", pad_row(rule.iter().map(String::as_str), &widths));
        for row in rows {
            println!("{}", pad_row(row.iter().map(String::as_str), &widths));
        }
        Ok(())
    }

    pub fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    pub fn print_info(&self, message: &str) {
        if !self.json {
            println!("{}", message);
        }
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("error: {}", message);
    }
}

fn pad_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}
