mod lock;
mod serve;

use anyhow::Result;
use clap::ArgMatches;

pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("serve", sub_m)) => serve::handle(sub_m).await,
        Some(("stat", sub_m)) => lock::handle_stat(sub_m).await,
        Some(("inspect", sub_m)) => lock::handle_inspect(sub_m).await,
        Some(("hold", sub_m)) => lock::handle_hold(sub_m).await,
        _ => anyhow::bail!("Unknown command. Run 'cachelock --help' for usage."),
    }
}
