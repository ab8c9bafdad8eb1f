use crate::config::EscrowConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Replay campus marketplace scenarios through the escrow orchestrator
#[derive(Parser, Debug)]
#[command(name = "campus-escrow")]
#[command(about = "Replay campus marketplace scenarios through the escrow orchestrator", long_about = None)]
pub struct CliArgs {
    /// Input CSV file path containing scenario actions
    #[arg(value_name = "INPUT", help = "Path to the scenario CSV file")]
    pub input_file: PathBuf,

    /// Age after which an open transaction is swept
    #[arg(
        long = "stale-after-hours",
        value_name = "HOURS",
        help = "Hours without update before an approved or payment_pending transaction is cancelled (default: 24)"
    )]
    pub stale_after_hours: Option<u64>,

    /// Maximum transactions cancelled per sweep
    #[arg(
        long = "sweep-batch",
        value_name = "COUNT",
        help = "Maximum number of transactions cancelled per sweep (default: 250)"
    )]
    pub sweep_batch: Option<usize>,

    /// Concurrent payment cleanups during a sweep
    #[arg(
        long = "sweep-concurrency",
        value_name = "COUNT",
        help = "Maximum number of concurrent payment cleanups per sweep (default: CPU cores)"
    )]
    pub sweep_concurrency: Option<usize>,

    /// Let sellers buy their own listings
    #[arg(long = "allow-self-trade")]
    pub allow_self_trade: bool,

    /// Move items to `sold` when their transaction completes
    #[arg(long = "mark-sold")]
    pub mark_sold: bool,
}

impl CliArgs {
    /// Create an EscrowConfig from CLI arguments
    ///
    /// Options that were not given keep their defaults; zero values fall back
    /// to the defaults with a warning.
    pub fn to_config(&self) -> EscrowConfig {
        let default = EscrowConfig::default();

        let mut config = EscrowConfig {
            allow_self_trade: self.allow_self_trade,
            mark_item_sold_on_completion: self.mark_sold,
            ..EscrowConfig::default()
        };

        if self.sweep_batch.is_some() || self.sweep_concurrency.is_some() {
            config = config.with_sweep(
                self.sweep_batch.unwrap_or(default.sweep_batch_limit),
                self.sweep_concurrency.unwrap_or(default.sweep_concurrency),
            );
        }

        if let Some(hours) = self.stale_after_hours {
            config = config.with_stale_after(Duration::from_secs(hours.saturating_mul(3600)));
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_options(&["program", "input.csv"], None, None, None)]
    #[case::stale_after(&["program", "--stale-after-hours", "48", "input.csv"], Some(48), None, None)]
    #[case::sweep_batch(&["program", "--sweep-batch", "10", "input.csv"], None, Some(10), None)]
    #[case::all_options(
        &["program", "--stale-after-hours", "1", "--sweep-batch", "10", "--sweep-concurrency", "2", "input.csv"],
        Some(1),
        Some(10),
        Some(2)
    )]
    fn test_config_options(
        #[case] args: &[&str],
        #[case] stale_after_hours: Option<u64>,
        #[case] sweep_batch: Option<usize>,
        #[case] sweep_concurrency: Option<usize>,
    ) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.stale_after_hours, stale_after_hours);
        assert_eq!(parsed.sweep_batch, sweep_batch);
        assert_eq!(parsed.sweep_concurrency, sweep_concurrency);
    }

    #[rstest]
    #[case::all_defaults(&["program", "input.csv"], 86_400, 250, num_cpus::get())]
    #[case::custom_stale(&["program", "--stale-after-hours", "2", "input.csv"], 7_200, 250, num_cpus::get())]
    #[case::custom_sweep(
        &["program", "--sweep-batch", "10", "--sweep-concurrency", "3", "input.csv"],
        86_400,
        10,
        3
    )]
    #[case::zero_stale(&["program", "--stale-after-hours", "0", "input.csv"], 86_400, 250, num_cpus::get())]
    #[case::zero_batch(&["program", "--sweep-batch", "0", "input.csv"], 86_400, 250, num_cpus::get())]
    #[case::zero_concurrency(&["program", "--sweep-concurrency", "0", "input.csv"], 86_400, 250, num_cpus::get())]
    fn test_config_conversion(
        #[case] args: &[&str],
        #[case] expected_stale_secs: u64,
        #[case] expected_batch: usize,
        #[case] expected_concurrency: usize,
    ) {
        let config = CliArgs::try_parse_from(args).unwrap().to_config();

        assert_eq!(config.stale_after, Duration::from_secs(expected_stale_secs));
        assert_eq!(config.sweep_batch_limit, expected_batch);
        assert_eq!(config.sweep_concurrency, expected_concurrency);
    }

    #[test]
    fn test_flags() {
        let config = CliArgs::try_parse_from(["program", "--allow-self-trade", "--mark-sold", "input.csv"])
            .unwrap()
            .to_config();

        assert!(config.allow_self_trade);
        assert!(config.mark_item_sold_on_completion);
    }

    #[test]
    fn test_missing_input_file() {
        assert!(CliArgs::try_parse_from(["program"]).is_err());
    }

    #[test]
    fn test_invalid_number() {
        assert!(CliArgs::try_parse_from(["program", "--sweep-batch", "many", "input.csv"]).is_err());
    }
}
