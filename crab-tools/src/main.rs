use anyhow::Result;
use clap::Parser;

use score_crab::helpers::{bootstrap, logging};

mod commands;
mod output;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[command(subcommand)]
    command: commands::Commands,
}

fn main() -> Result<()> {
    bootstrap::run(Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    commands::handle(cli.command)
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, ResultAssertion};
    use clap::Parser;

    use super::Cli;

    const DB: &str = "--database-url=postgres://localhost/scores";

    #[test]
    fn parses_nested_subcommands() {
        // given
        let args = ["crab-tools", "scores", DB, "checks", "3", "ssh-01"];

        // when
        let cli = Cli::try_parse_from(args);

        // then
        assert_that!(cli.map(|_| ())).is_ok();
    }

    #[test]
    fn team_update_takes_explicit_bool() {
        let args = ["crab-tools", "teams", DB, "update", "2", "--active", "false"];
        assert_that!(Cli::try_parse_from(args).map(|_| ())).is_ok();
    }

    #[test]
    fn pcr_set_needs_a_password() {
        let args = ["crab-tools", "pcr", DB, "set", "1", "web", "admin"];
        assert_that!(Cli::try_parse_from(args).map(|_| ())).is_err();
    }
}
