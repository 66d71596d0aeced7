use anyhow::{Context, Result, bail};
use cadence_core::TxnHandle;
use cadence_core::types::{MAX_COUNTER, MAX_TIMESTAMP, MP_PARTITION_ID};
use cadence_core::unique_id::{EPOCH_MS, UniqueIdGenerator};
use clap::{Args, Subcommand};
use serde::Serialize;

use super::OutputContext;

#[derive(Args)]
pub struct HandleArgs {
    #[command(subcommand)]
    pub command: HandleCommand,
}

#[derive(Subcommand)]
pub enum HandleCommand {
    /// Split a raw handle into its fields
    Decode {
        /// Raw handle, decimal or 0x-prefixed hex
        raw: String,
    },
    /// Build a raw handle from its fields
    Compose {
        /// Unix time in milliseconds
        #[arg(long)]
        unix_ms: i64,
        /// Per-millisecond counter
        #[arg(long, default_value_t = 0)]
        counter: u64,
        /// Partition id
        #[arg(long)]
        partition: u16,
    },
}

#[derive(Debug, Serialize)]
struct DecodedHandle {
    raw: u64,
    timestamp: u64,
    counter: u64,
    partition: u16,
    multi_partition: bool,
    unix_ms: i64,
    time: String,
}

impl From<TxnHandle> for DecodedHandle {
    fn from(handle: TxnHandle) -> Self {
        let unix_ms = UniqueIdGenerator::unix_millis(handle);
        let time = chrono::DateTime::from_timestamp_millis(unix_ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Self {
            raw: handle.raw(),
            timestamp: handle.timestamp(),
            counter: handle.counter(),
            partition: handle.partition(),
            multi_partition: handle.is_multi_partition(),
            unix_ms,
            time,
        }
    }
}

pub fn parse_raw(text: &str) -> Result<TxnHandle> {
    let text = text.trim();
    let raw = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    }
    .with_context(|| format!("'{}' is not a handle", text))?;
    Ok(TxnHandle::from_raw(raw))
}

pub fn compose(unix_ms: i64, counter: u64, partition: u16) -> Result<TxnHandle> {
    let timestamp = unix_ms - EPOCH_MS;
    if timestamp < 0 || timestamp as u64 > MAX_TIMESTAMP {
        bail!("{} ms is outside the representable handle range", unix_ms);
    }
    if counter > MAX_COUNTER {
        bail!("counter {} exceeds {}", counter, MAX_COUNTER);
    }
    if partition > MP_PARTITION_ID {
        bail!("partition {} exceeds {}", partition, MP_PARTITION_ID);
    }
    Ok(TxnHandle::compose(timestamp as u64, counter, partition))
}

pub fn execute(args: HandleArgs, output: &OutputContext) -> Result<()> {
    let handle = match args.command {
        HandleCommand::Decode { raw } => parse_raw(&raw)?,
        HandleCommand::Compose {
            unix_ms,
            counter,
            partition,
        } => compose(unix_ms, counter, partition)?,
    };
    let decoded = DecodedHandle::from(handle);
    if output.json {
        return output.print_json(&decoded);
    }
    output.print_table(
        &["field", "value"],
        &[
            vec!["raw".into(), decoded.raw.to_string()],
            vec!["timestamp".into(), decoded.timestamp.to_string()],
            vec!["counter".into(), decoded.counter.to_string()],
            vec!["partition".into(), decoded.partition.to_string()],
            vec!["multi_partition".into(), decoded.multi_partition.to_string()],
            vec!["time".into(), decoded.time],
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!(parse_raw("255").unwrap(), parse_raw("0xff").unwrap());
        assert!(parse_raw("nope").is_err());
    }

    #[test]
    fn test_compose_decodes_back() {
        let handle = compose(EPOCH_MS + 5_000, 7, 12).unwrap();
        let decoded = DecodedHandle::from(handle);
        assert_eq!(decoded.timestamp, 5_000);
        assert_eq!(decoded.counter, 7);
        assert_eq!(decoded.partition, 12);
        assert_eq!(decoded.unix_ms, EPOCH_MS + 5_000);
        assert!(!decoded.multi_partition);
        assert!(decoded.time.starts_with("2008-01-01"));
    }

    #[test]
    fn test_compose_rejects_out_of_range() {
        assert!(compose(EPOCH_MS - 1, 0, 1).is_err());
        assert!(compose(EPOCH_MS, MAX_COUNTER + 1, 1).is_err());
        assert!(compose(EPOCH_MS, 0, MP_PARTITION_ID + 1).is_err());
    }
}
