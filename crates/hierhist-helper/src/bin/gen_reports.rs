//! Report generator
//!
//! Splits `(alpha, beta)` contributions into key shares for two helpers.
//!
//! ```bash
//! cargo run -p hierhist-helper --bin gen-reports -- \
//!     --log-domain-sizes 2,4,8 --records records.csv --output-dir ./reports
//! ```

use std::path::PathBuf;

use clap::Parser;
use hierhist_core::batch::BlobBatch;
use hierhist_dpf::{generate_keys, Parameters};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gen-reports")]
#[command(about = "Generate key-share reports for two helpers")]
struct Args {
    /// Bit-length of each hierarchy level, ascending
    #[arg(long, value_delimiter = ',', required = true)]
    log_domain_sizes: Vec<u32>,

    /// Bit width of the aggregated values
    #[arg(long, default_value = "32")]
    value_bits: u32,

    /// CSV file of `alpha,beta` lines (beta defaults to 1)
    #[arg(long)]
    records: Option<PathBuf>,

    /// Generate this many uniformly random contributions of weight 1
    #[arg(long)]
    random: Option<usize>,

    /// Output directory for params.bin, reports-0.bin and reports-1.bin
    #[arg(long, default_value = "./reports")]
    output_dir: PathBuf,
}

fn parse_records(text: &str) -> anyhow::Result<Vec<(u64, u64)>> {
    let mut records = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let alpha = fields
            .next()
            .unwrap_or_default()
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("line {}: bad alpha: {}", number + 1, e))?;
        let beta = match fields.next() {
            Some(field) => field
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("line {}: bad beta: {}", number + 1, e))?,
            None => 1,
        };
        records.push((alpha, beta));
    }
    Ok(records)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gen_reports=info".parse()?))
        .init();

    let args = Args::parse();
    let parameters = Parameters::uniform(&args.log_domain_sizes, args.value_bits)?;

    let mut records = match &args.records {
        Some(path) => parse_records(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };
    if let Some(count) = args.random {
        let bits = parameters.final_log_domain_size();
        let mut rng = rand::thread_rng();
        records.extend((0..count).map(|_| {
            let alpha = if bits == 64 {
                rng.gen::<u64>()
            } else {
                rng.gen_range(0..1u64 << bits)
            };
            (alpha, 1)
        }));
    }
    if records.is_empty() {
        anyhow::bail!("no records: pass --records and/or --random");
    }

    let mut shares = [Vec::with_capacity(records.len()), Vec::with_capacity(records.len())];
    for &(alpha, beta) in &records {
        let (first, second) = generate_keys(&parameters, alpha, beta)?;
        shares[0].push(first.to_bytes()?);
        shares[1].push(second.to_bytes()?);
    }

    std::fs::create_dir_all(&args.output_dir)?;
    std::fs::write(args.output_dir.join("params.bin"), parameters.to_bytes()?)?;
    for (party, blobs) in shares.into_iter().enumerate() {
        let path = args.output_dir.join(format!("reports-{}.bin", party));
        std::fs::write(&path, BlobBatch::new(blobs).to_bytes()?)?;
    }

    tracing::info!(
        reports = records.len(),
        levels = parameters.num_levels(),
        digest = %hex::encode(parameters.digest()),
        "Generated reports"
    );
    println!(
        "[OK] Wrote {} reports to {}",
        records.len(),
        args.output_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records() {
        let records = parse_records("# alpha,beta\n5,2\n\n7\n").unwrap();
        assert_eq!(records, vec![(5, 2), (7, 1)]);
        assert!(parse_records("x,1").is_err());
    }
}
