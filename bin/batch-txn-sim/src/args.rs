use std::path::PathBuf;

use argh::FromArgs;

#[derive(Debug, Clone, FromArgs)]
#[argh(description = "Batch transaction load generator")]
pub(crate) struct Args {
    #[argh(option, short = 'c', description = "path to TOML config file")]
    pub config: Option<PathBuf>,

    #[argh(option, short = 't', description = "number of concurrent caller threads")]
    pub callers: Option<usize>,

    #[argh(option, short = 'n', description = "updates issued by each caller")]
    pub updates: Option<usize>,

    #[argh(option, short = 'a', description = "number of ledger accounts")]
    pub accounts: Option<u32>,

    #[argh(option, short = 'b', description = "max updates per transaction")]
    pub max_batch: Option<usize>,

    #[argh(
        option,
        short = 'p',
        description = "probability of a simulated write conflict on commit"
    )]
    pub conflict_rate: Option<f64>,

    #[argh(option, short = 'r', description = "max transaction retries")]
    pub max_retries: Option<u32>,

    #[argh(option, description = "directory for rolling log files")]
    pub log_dir: Option<PathBuf>,

    #[argh(switch, description = "emit logs as JSON")]
    pub json: bool,
}
